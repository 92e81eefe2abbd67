pub mod cloudflare;
pub mod image_metadata;
pub mod image_store;
