use std::fmt;

use url::Url;

/// Position of the image id after splitting the URL path on `/`.
///
/// The path keeps its leading slash, so `/cdn-cgi/imagedelivery/<hash>/<id>/<variant>`
/// splits into `["", "cdn-cgi", "imagedelivery", "<hash>", "<id>", ...]`.
pub const IMAGE_ID_SEGMENT: usize = 4;

/// Cloudflare image identifier derived from a delivery URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extract the image id from a delivery URL.
///
/// Returns `None` when the URL does not parse, when its path has fewer than
/// five `/`-separated segments, or when the id segment is empty. Never panics.
pub fn extract_image_id(url: &str) -> Option<ImageId> {
    let parsed = Url::parse(url.trim()).ok()?;
    parsed
        .path()
        .split('/')
        .nth(IMAGE_ID_SEGMENT)
        .filter(|segment| !segment.is_empty())
        .map(ImageId::new)
}
