use std::{fmt, sync::Arc};

use image::RgbaImage;

use crate::{BeatReelError, Result};

/// A decoded still image, referenced by a stable id.
#[derive(Clone)]
pub struct ImageAsset {
    id: String,
    bitmap: Arc<RgbaImage>,
}

impl ImageAsset {
    pub fn new(id: impl Into<String>, bitmap: RgbaImage) -> Result<Self> {
        let id = id.into();
        if bitmap.width() == 0 || bitmap.height() == 0 {
            return Err(BeatReelError::ImageDecode {
                id,
                reason: "image has no pixels".to_string(),
            });
        }
        Ok(Self {
            id,
            bitmap: Arc::new(bitmap),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bitmap(&self) -> &RgbaImage {
        &self.bitmap
    }

    pub fn width(&self) -> u32 {
        self.bitmap.width()
    }

    pub fn height(&self) -> u32 {
        self.bitmap.height()
    }
}

impl fmt::Debug for ImageAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageAsset")
            .field("id", &self.id)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// Decodes an encoded image (PNG, JPEG) into an [`ImageAsset`].
pub fn decode_image(id: impl Into<String>, bytes: &[u8]) -> Result<ImageAsset> {
    let id = id.into();
    let decoded = image::load_from_memory(bytes).map_err(|err| BeatReelError::ImageDecode {
        id: id.clone(),
        reason: err.to_string(),
    })?;
    ImageAsset::new(id, decoded.to_rgba8())
}

/// Ordered, cyclic sequence of images. Only the transition animator moves
/// the current index.
#[derive(Debug, Clone, Default)]
pub struct Playlist {
    assets: Vec<ImageAsset>,
    index: usize,
}

impl Playlist {
    pub fn new(assets: Vec<ImageAsset>) -> Self {
        Self { assets, index: 0 }
    }

    /// Keeps every successfully decoded asset; failures are logged and left out.
    pub fn from_results<I>(results: I) -> Self
    where
        I: IntoIterator<Item = Result<ImageAsset>>,
    {
        let assets = results
            .into_iter()
            .filter_map(|result| match result {
                Ok(asset) => Some(asset),
                Err(err) => {
                    tracing::warn!(%err, "image excluded from playlist");
                    None
                }
            })
            .collect();
        Self::new(assets)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> Option<&ImageAsset> {
        self.assets.get(self.index)
    }

    pub fn assets(&self) -> &[ImageAsset] {
        &self.assets
    }

    /// Moves to the next image, wrapping at the end.
    pub(crate) fn advance(&mut self) -> Option<&ImageAsset> {
        if self.assets.is_empty() {
            return None;
        }
        self.index = (self.index + 1) % self.assets.len();
        self.assets.get(self.index)
    }
}
