//! Bounding-box geometry helpers.

use crate::types::BoundingBox;

const EPSILON: f32 = 1e-6;

/// Intersection-over-union of two boxes.
///
/// Symmetric, `iou(a, a) == 1.0` for any box with positive area, and `0.0`
/// for disjoint or degenerate boxes.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - intersection;

    if union <= EPSILON {
        return 0.0;
    }

    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bx(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox::new(x, y, w, h)
    }

    #[test]
    fn test_iou_identical_boxes() {
        let a = bx(10.0, 10.0, 50.0, 50.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = bx(0.0, 0.0, 10.0, 10.0);
        let b = bx(20.0, 20.0, 10.0, 10.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = bx(0.0, 0.0, 50.0, 50.0);
        let b = bx(25.0, 25.0, 50.0, 50.0);
        // Intersection 625, union 2500 + 2500 - 625 = 4375
        assert!((iou(&a, &b) - 625.0 / 4375.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_symmetric() {
        let pairs = [
            (bx(0.0, 0.0, 30.0, 30.0), bx(10.0, 10.0, 30.0, 30.0)),
            (bx(5.0, 5.0, 1.0, 100.0), bx(0.0, 50.0, 100.0, 1.0)),
            (bx(-10.0, -10.0, 20.0, 20.0), bx(0.0, 0.0, 5.0, 5.0)),
        ];
        for (a, b) in &pairs {
            assert_eq!(iou(a, b), iou(b, a));
        }
    }

    #[test]
    fn test_iou_degenerate_boxes() {
        let a = bx(0.0, 0.0, 0.0, 0.0);
        assert_eq!(iou(&a, &a), 0.0);
    }

    #[test]
    fn test_iou_contained_box() {
        let outer = bx(0.0, 0.0, 100.0, 100.0);
        let inner = bx(25.0, 25.0, 50.0, 50.0);
        assert!((iou(&outer, &inner) - 0.25).abs() < 1e-6);
    }
}
