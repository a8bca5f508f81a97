use serde::{Deserialize, Serialize};

/// Bounding box for a detected face in pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Center point (cx, cy) — the quantity tracked by the motion estimator.
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Rebuild a box of the same size around a new center.
    pub fn with_center(&self, cx: f32, cy: f32) -> Self {
        Self {
            x: cx - self.width / 2.0,
            y: cy - self.height / 2.0,
            width: self.width,
            height: self.height,
        }
    }
}

/// Face embedding vector (typically 512-dimensional).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// L2-normalize in place so that inner product equals cosine similarity.
    /// A zero vector is left untouched.
    pub fn l2_normalize(&mut self) {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
    }

    pub fn dot(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Little-endian byte view, used as a cache key source.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.values.len() * 4);
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

/// Externally computed anti-spoof sub-scores for one detection.
///
/// Each sub-score is in [0, 1] when the corresponding model was invoked;
/// `None` means the model did not run for this frame.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpoofSignals {
    pub texture: Option<f32>,
    pub depth: Option<f32>,
    pub blink: Option<f32>,
}

/// One face detection for a single frame, produced by the external
/// detector/encoder pipeline.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    /// Raw (not yet normalized) embedding, when the encoder ran on this crop.
    pub embedding: Option<Embedding>,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
    pub spoof: SpoofSignals,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            bbox,
            confidence,
            embedding: None,
            landmarks: None,
            spoof: SpoofSignals::default(),
        }
    }

    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_spoof(mut self, spoof: SpoofSignals) -> Self {
        self.spoof = spoof;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_center_roundtrip() {
        let b = BoundingBox::new(10.0, 20.0, 50.0, 40.0);
        let (cx, cy) = b.center();
        assert_eq!((cx, cy), (35.0, 40.0));
        let b2 = b.with_center(cx, cy);
        assert_eq!(b, b2);
    }

    #[test]
    fn test_embedding_normalize() {
        let mut e = Embedding::new(vec![3.0, 4.0]);
        e.l2_normalize();
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);
        assert!((e.dot(&e) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_normalize_zero_vector() {
        let mut e = Embedding::new(vec![0.0, 0.0, 0.0]);
        e.l2_normalize();
        assert_eq!(e.values, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_embedding_bytes_le() {
        let e = Embedding::new(vec![1.0]);
        assert_eq!(e.as_bytes(), 1.0f32.to_le_bytes().to_vec());
    }
}
