//! Shared helpers for the integration suite: small image-building
//! shorthands and a driver that runs a future to completion.
#![allow(dead_code)]

use std::sync::Arc;

use skein::{
    ExecOptions, HostFuture, ImageBuilder, MethodBody, ModuleImage, NoopTracer, Op, Runtime, RuntimeBuilder,
    value::FutureResult,
};

/// Builds a method body with default slot metadata.
pub fn body(name: &str, ops: Vec<Op>, max_vars: usize) -> Arc<MethodBody> {
    Arc::new(MethodBody::new(name, ops, max_vars, 0, 1))
}

/// Builds a runtime over an image, with default options.
pub fn runtime(image: ModuleImage) -> Runtime {
    RuntimeBuilder::new(image).build().expect("runtime builds")
}

/// Builds a runtime with a specific op budget.
pub fn runtime_with_budget(image: ModuleImage, ops_per_tick: u32) -> Runtime {
    RuntimeBuilder::new(image)
        .options(ExecOptions {
            ops_per_tick,
            ..ExecOptions::default()
        })
        .build()
        .expect("runtime builds")
}

/// Drives the container until the future resolves.
pub fn drive(runtime: &Runtime, future: &HostFuture) -> FutureResult {
    runtime.run_until_idle(&mut NoopTracer);
    future.try_get().expect("future completed")
}

/// An image with nothing but entries.
pub fn image_of(entries: Vec<(&str, Arc<MethodBody>)>) -> ModuleImage {
    let mut builder = ImageBuilder::new("test");
    for (name, body) in entries {
        builder = builder.entry(name, body);
    }
    builder.build().expect("image validates")
}
