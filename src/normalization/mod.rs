pub mod image_url;
