//! Image file decoding and encoding.
//!
//! Decoding accepts anything the `image` crate can read and converts it to RGB8.
//! Encoding picks the format from the file extension and writes atomically: pixels
//! go to a temporary file in the destination directory, which is then renamed over
//! the target, so an interrupted run never leaves a half-written image behind.

use crate::error::StripResult;
use crate::raster::{Image, Strip};
use image::{ExtendedColorType, ImageFormat};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Read an image file as RGB8.
pub fn decode(path: &Path) -> StripResult<Image> {
    let rgb = image::open(path)?.to_rgb8();
    let (width, height) = rgb.dimensions();
    debug!(path = %path.display(), width, height, "Image decoded");
    Image::new(width, height, rgb.into_raw())
}

/// Write `image` to `path`, choosing the encoder from the extension.
pub fn encode(image: &Image, path: &Path) -> StripResult<()> {
    let format = ImageFormat::from_path(path)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut staged = tempfile::Builder::new()
        .prefix(".strip-blur-")
        .tempfile_in(dir)?;
    image::write_buffer_with_format(
        staged.as_file_mut(),
        image.as_bytes(),
        image.width(),
        image.height(),
        ExtendedColorType::Rgb8,
        format,
    )?;
    staged.persist(path).map_err(|err| err.error)?;

    debug!(path = %path.display(), ?format, "Image encoded");
    Ok(())
}

/// File name for strip `index`: `{prefix}_{index + 1}.{extension}`.
pub fn strip_path(prefix: &str, index: usize, extension: &str) -> PathBuf {
    PathBuf::from(format!("{}_{}.{}", prefix, index + 1, extension))
}

/// Save every strip to its own file, returning the paths written.
pub fn save_strips(strips: &[Strip], prefix: &str, extension: &str) -> StripResult<Vec<PathBuf>> {
    let paths = strips
        .iter()
        .map(|strip| {
            let path = strip_path(prefix, strip.index, extension);
            encode(&strip.image, &path)?;
            Ok(path)
        })
        .collect::<StripResult<Vec<_>>>()?;
    info!(count = paths.len(), prefix, "Strips saved");
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StripError;
    use crate::partition::split;
    use crate::raster::tests::gradient;

    #[test]
    fn png_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gradient.png");
        let image = gradient(17, 9);

        encode(&image, &path).unwrap();
        assert_eq!(decode(&path).unwrap(), image);
    }

    #[test]
    fn jpeg_keeps_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gradient.jpg");
        encode(&gradient(20, 12), &path).unwrap();

        let decoded = decode(&path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (20, 12));
    }

    #[test]
    fn unknown_extension_is_a_codec_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = encode(&gradient(2, 2), &dir.path().join("out.nope")).unwrap_err();
        assert!(matches!(err, StripError::Codec(_)), "got {err:?}");
    }

    #[test]
    fn missing_input_fails_to_decode() {
        let dir = tempfile::tempdir().unwrap();
        assert!(decode(&dir.path().join("absent.png")).is_err());
    }

    #[test]
    fn strips_are_numbered_from_one() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("part");
        let prefix = prefix.to_string_lossy();
        let strips = split(&gradient(9, 4), 3).unwrap();

        let paths = save_strips(&strips, &prefix, "png").unwrap();
        let names: Vec<String> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["part_1.png", "part_2.png", "part_3.png"]);
        assert_eq!(decode(&paths[1]).unwrap(), strips[1].image);
    }
}
