//! Reassembler: concatenates ordered strips back into one image.

use crate::error::{StripError, StripResult};
use crate::raster::{Image, Strip};

/// Paste `strips` left to right at cumulative x-offsets.
///
/// The result is as wide as the strips together and as tall as each of them.
/// Strips are placed in sequence order; their recorded `offset_x` is not consulted.
pub fn combine(strips: &[Strip]) -> StripResult<Image> {
    let first = strips
        .first()
        .ok_or(StripError::InvalidPartitionCount {
            requested: 0,
            width: 0,
        })?;
    let height = first.height();
    if let Some(odd) = strips.iter().find(|strip| strip.height() != height) {
        return Err(StripError::ShapeMismatch(format!(
            "strip {} is {} pixels tall, strip {} is {}",
            odd.index,
            odd.height(),
            first.index,
            height
        )));
    }

    let width = strips.iter().try_fold(0u32, |total, strip| {
        total.checked_add(strip.width()).ok_or_else(|| {
            StripError::ShapeMismatch("combined strip width overflows u32".to_string())
        })
    })?;

    let mut image = Image::blank(width, height);
    let mut x = 0;
    for strip in strips {
        image.paste_columns(x, &strip.image)?;
        x += strip.width();
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::split;
    use crate::raster::tests::gradient;

    #[test]
    fn widths_add_up() {
        let strips = vec![
            Strip::new(0, 0, gradient(10, 20)),
            Strip::new(1, 10, gradient(10, 20)),
            Strip::new(2, 20, gradient(12, 20)),
        ];
        let image = combine(&strips).unwrap();
        assert_eq!((image.width(), image.height()), (32, 20));
        assert_eq!(image.pixel(21, 3), strips[2].image.pixel(1, 3));
    }

    #[test]
    fn split_then_combine_is_identity() {
        let image = gradient(101, 13);
        for n in [1, 2, 3, 7, 101] {
            let strips = split(&image, n).unwrap();
            assert_eq!(combine(&strips).unwrap(), image, "n = {n}");
        }
    }

    #[test]
    fn uneven_heights_are_rejected() {
        let strips = vec![
            Strip::new(0, 0, gradient(4, 5)),
            Strip::new(1, 4, gradient(4, 6)),
        ];
        assert!(matches!(
            combine(&strips),
            Err(StripError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn nothing_to_combine() {
        assert!(matches!(
            combine(&[]),
            Err(StripError::InvalidPartitionCount { requested: 0, .. })
        ));
    }
}
