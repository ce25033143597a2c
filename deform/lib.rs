#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod builder;
pub mod codec;
pub mod config;
pub mod deformer;
pub mod geometry;
pub mod linalg;
pub mod pca;
pub mod sampler;
#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod shared {
    pub use super::shared_files as files;
}
