//! Audio Resource Adapters

mod audio_resource_loader;

pub use audio_resource_loader::AudioResourceLoader;
