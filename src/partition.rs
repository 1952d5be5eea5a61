//! Strip partitioner.
//!
//! Splits an image into `n` contiguous, full-height strips. Every strip is
//! `floor(width / n)` pixels wide except the last one, which absorbs the remainder,
//! so a 100 pixel wide image split three ways yields widths `[33, 33, 34]`.
//!
//! A count of zero or a count wider than the image is rejected with
//! [`StripError::InvalidPartitionCount`]; the partitioner never produces empty strips.

use crate::error::{StripError, StripResult};
use crate::raster::{Image, Shape, Strip};

/// Column range `[start, end)` of every strip for an image `width` pixels wide.
pub fn strip_bounds(width: u32, n: usize) -> StripResult<Vec<(u32, u32)>> {
    if n == 0 || n > width as usize {
        return Err(StripError::InvalidPartitionCount {
            requested: n,
            width,
        });
    }
    // n <= width, so the conversion cannot truncate.
    let parts = n as u32;
    let part_width = width / parts;
    Ok((0..parts)
        .map(|i| {
            let start = i * part_width;
            let end = if i + 1 == parts {
                width
            } else {
                start + part_width
            };
            (start, end)
        })
        .collect())
}

/// Split `image` into `n` ordered strips.
pub fn split(image: &Image, n: usize) -> StripResult<Vec<Strip>> {
    strip_bounds(image.width(), n)?
        .into_iter()
        .enumerate()
        .map(|(index, (start, end))| Ok(Strip::new(index, start, image.crop_columns(start, end)?)))
        .collect()
}

/// True when every strip has the same shape (and there is at least one).
pub fn is_uniform(strips: &[Strip]) -> bool {
    uniform_shape(strips).is_some()
}

/// The shape shared by every strip, if there is one.
pub fn uniform_shape(strips: &[Strip]) -> Option<Shape> {
    let first = strips.first()?.shape();
    strips
        .iter()
        .all(|strip| strip.shape() == first)
        .then_some(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::tests::gradient;

    #[test]
    fn hundred_wide_in_three_absorbs_remainder() {
        let image = gradient(100, 50);
        let strips = split(&image, 3).unwrap();
        let widths: Vec<u32> = strips.iter().map(Strip::width).collect();
        assert_eq!(widths, vec![33, 33, 34]);
        assert!(strips.iter().all(|s| s.height() == 50));
        assert_eq!(
            strips.iter().map(|s| s.offset_x).collect::<Vec<_>>(),
            vec![0, 33, 66]
        );
    }

    #[test]
    fn strips_cover_width_without_gaps() {
        for width in [1u32, 2, 7, 31, 64, 101] {
            for n in 1..=width.min(12) as usize {
                let bounds = strip_bounds(width, n).unwrap();
                assert_eq!(bounds.len(), n);
                assert_eq!(bounds[0].0, 0);
                assert_eq!(bounds[n - 1].1, width);
                for pair in bounds.windows(2) {
                    assert_eq!(pair[0].1, pair[1].0, "gap or overlap at width {width}, n {n}");
                }
                let total: u32 = bounds.iter().map(|(s, e)| e - s).sum();
                assert_eq!(total, width);
                assert!(bounds.iter().all(|(s, e)| e > s));
            }
        }
    }

    #[test]
    fn rejects_zero_and_too_many_strips() {
        let image = gradient(4, 2);
        assert!(matches!(
            split(&image, 0),
            Err(StripError::InvalidPartitionCount { requested: 0, width: 4 })
        ));
        assert!(matches!(
            split(&image, 5),
            Err(StripError::InvalidPartitionCount { requested: 5, width: 4 })
        ));
        assert_eq!(split(&image, 4).unwrap().len(), 4);
    }

    #[test]
    fn single_strip_is_whole_image() {
        let image = gradient(17, 5);
        let strips = split(&image, 1).unwrap();
        assert_eq!(strips.len(), 1);
        assert_eq!(strips[0].image, image);
    }

    #[test]
    fn uniformity_depends_on_remainder() {
        let image = gradient(90, 4);
        assert!(is_uniform(&split(&image, 3).unwrap()));
        assert_eq!(
            uniform_shape(&split(&image, 3).unwrap()),
            Some(Shape::rgb(30, 4))
        );
        assert!(!is_uniform(&split(&image, 4).unwrap()));
        assert!(!is_uniform(&[]));
    }
}
