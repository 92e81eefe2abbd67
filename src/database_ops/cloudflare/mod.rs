pub mod provider;

pub use provider::{interpret_body, CloudflareImagesProvider, FetchOutcome, ImageEnvelope};

use crate::database_ops::image_metadata::MetadataSource;
use crate::normalization::image_url::ImageId;

#[async_trait::async_trait]
impl MetadataSource for CloudflareImagesProvider {
    async fn fetch_metadata(&self, image_id: &ImageId) -> FetchOutcome {
        CloudflareImagesProvider::fetch_metadata(self, image_id).await
    }
}
