//! Boosted Haar cascade in OpenCV's XML format.
//!
//! Loads `opencv-cascade-classifier` files (the format of
//! `haarcascade_frontalface_default.xml`) and evaluates detection windows on
//! integral images. Only stump-based BOOST cascades over upright HAAR
//! features are supported.

use image::GrayImage;
use roxmltree::Node;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Slack subtracted from every stage threshold, as OpenCV does on load.
const STAGE_THRESHOLD_EPS: f32 = 1e-5;

/// Largest image (in pixels) whose integral sum still fits in `u32`.
pub(crate) const MAX_INTEGRAL_PIXELS: u64 = u32::MAX as u64 / 255;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0} — install OpenCV's {file}", file = crate::DEFAULT_CASCADE_FILE)]
    ModelNotFound(String),
    #[error("failed to read cascade {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cascade XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("cascade is missing <{0}>")]
    MissingElement(&'static str),
    #[error("invalid <{element}> in cascade: {value}")]
    InvalidValue { element: &'static str, value: String },
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f32,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

impl HaarFeature {
    /// Weighted rectangle sum for a window whose top-left corner is (x, y).
    fn evaluate(&self, integral: &IntegralImage, x: u32, y: u32) -> f64 {
        self.rects
            .iter()
            .map(|r| integral.sum(x + r.x, y + r.y, r.width, r.height) as f64 * r.weight as f64)
            .sum()
    }
}

/// Depth-1 weak classifier: one feature, one threshold, two leaves.
#[derive(Debug, Clone, Copy)]
struct Stump {
    feature: usize,
    threshold: f32,
    left: f32,
    right: f32,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f32,
    stumps: Vec<Stump>,
}

/// Outcome of running the cascade on a single window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Accepted,
    /// Rejected by the stage with this index.
    Rejected(usize),
}

/// A loaded, immutable Haar cascade. Cheap to share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Load a cascade from an OpenCV XML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CascadeError::ModelNotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path).map_err(|source| CascadeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cascade = Self::from_xml(&xml)?;

        tracing::info!(
            path = %path.display(),
            window = ?cascade.window_size(),
            stages = cascade.stage_count(),
            features = cascade.feature_count(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse a cascade from OpenCV XML text.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(xml)?;
        let root = doc.root_element();

        let cascade = if root.tag_name().name() == "cascade" {
            root
        } else {
            match find_child(root, "cascade") {
                Some(node) => node,
                None if root.children().any(|n| n.attribute("type_id") == Some("opencv-haar-classifier")) => {
                    return Err(CascadeError::Unsupported(
                        "old-style opencv-haar-classifier format".into(),
                    ))
                }
                None => return Err(CascadeError::MissingElement("cascade")),
            }
        };

        let stage_type = child_text(cascade, "stageType")?;
        if stage_type != "BOOST" {
            return Err(CascadeError::Unsupported(format!("stage type {stage_type}")));
        }
        let feature_type = child_text(cascade, "featureType")?;
        if feature_type != "HAAR" {
            return Err(CascadeError::Unsupported(format!("feature type {feature_type}")));
        }

        let window_width: u32 = parse_scalar(child_text(cascade, "width")?, "width")?;
        let window_height: u32 = parse_scalar(child_text(cascade, "height")?, "height")?;
        if window_width < 3 || window_height < 3 {
            return Err(CascadeError::InvalidValue {
                element: "width",
                value: format!("{window_width}x{window_height}"),
            });
        }

        let features = items(child(cascade, "features")?)
            .map(|node| parse_feature(node, window_width, window_height))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = items(child(cascade, "stages")?)
            .map(|node| parse_stage(node, features.len()))
            .collect::<Result<Vec<_>, _>>()?;

        if stages.is_empty() {
            return Err(CascadeError::MissingElement("stages/_"));
        }

        Ok(Self {
            window_width,
            window_height,
            stages,
            features,
        })
    }

    /// Base detection window (width, height) the cascade was trained on.
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    /// Run every stage on the window at (x, y) of the integral image.
    ///
    /// Feature responses are divided by the window's standard deviation
    /// (times the normalization area) over the window inset by one pixel.
    pub(crate) fn evaluate(&self, integral: &IntegralImage, x: u32, y: u32) -> Verdict {
        let norm_w = self.window_width - 2;
        let norm_h = self.window_height - 2;
        let area = (norm_w * norm_h) as f64;
        let sum = integral.sum(x + 1, y + 1, norm_w, norm_h) as f64;
        let sqsum = integral.sqsum(x + 1, y + 1, norm_w, norm_h) as f64;

        let variance = area * sqsum - sum * sum;
        let inv_norm = if variance > 0.0 { 1.0 / variance.sqrt() } else { 1.0 };

        for (idx, stage) in self.stages.iter().enumerate() {
            let mut stage_sum = 0.0f64;
            for stump in &stage.stumps {
                let value = self.features[stump.feature].evaluate(integral, x, y) * inv_norm;
                stage_sum += if value < stump.threshold as f64 {
                    stump.left as f64
                } else {
                    stump.right as f64
                };
            }
            if stage_sum < stage.threshold as f64 {
                return Verdict::Rejected(idx);
            }
        }

        Verdict::Accepted
    }
}

/// Summed-area tables of pixel values and squared pixel values.
pub(crate) struct IntegralImage {
    stride: usize,
    sum: Vec<u32>,
    sqsum: Vec<u64>,
}

impl IntegralImage {
    /// Build the tables. Callers keep images under [`MAX_INTEGRAL_PIXELS`].
    pub(crate) fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u32; stride * (h + 1)];
        let mut sqsum = vec![0u64; stride * (h + 1)];
        let raw = gray.as_raw();

        for y in 0..h {
            let mut row_sum = 0u32;
            let mut row_sqsum = 0u64;
            for x in 0..w {
                let p = raw[y * w + x];
                row_sum += p as u32;
                row_sqsum += (p as u64) * (p as u64);
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row_sum;
                sqsum[idx] = sqsum[idx - stride] + row_sqsum;
            }
        }

        Self { stride, sum, sqsum }
    }

    fn corners(&self, x: u32, y: u32, w: u32, h: u32) -> [usize; 4] {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = ((x + w) as usize, (y + h) as usize);
        [
            y0 * self.stride + x0,
            y0 * self.stride + x1,
            y1 * self.stride + x0,
            y1 * self.stride + x1,
        ]
    }

    pub(crate) fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u32 {
        let [tl, tr, bl, br] = self.corners(x, y, w, h);
        // True result fits in u32; intermediate terms may wrap.
        self.sum[br]
            .wrapping_add(self.sum[tl])
            .wrapping_sub(self.sum[tr])
            .wrapping_sub(self.sum[bl])
    }

    pub(crate) fn sqsum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let [tl, tr, bl, br] = self.corners(x, y, w, h);
        (self.sqsum[br] + self.sqsum[tl]) - (self.sqsum[tr] + self.sqsum[bl])
    }
}

// --- XML helpers ---

fn find_child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &'static str) -> Result<Node<'a, 'input>, CascadeError> {
    find_child(node, name).ok_or(CascadeError::MissingElement(name))
}

fn child_text<'a>(node: Node<'a, '_>, name: &'static str) -> Result<&'a str, CascadeError> {
    Ok(child(node, name)?.text().unwrap_or("").trim())
}

/// OpenCV stores sequences as repeated `<_>` elements.
fn items<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(|n| n.is_element() && n.tag_name().name() == "_")
}

fn parse_scalar<T: FromStr>(raw: &str, element: &'static str) -> Result<T, CascadeError> {
    raw.trim().parse().map_err(|_| CascadeError::InvalidValue {
        element,
        value: raw.to_string(),
    })
}

fn parse_list<T: FromStr>(raw: &str, element: &'static str) -> Result<Vec<T>, CascadeError> {
    raw.split_whitespace()
        .map(|tok| parse_scalar(tok, element))
        .collect()
}

fn parse_feature(node: Node, window_width: u32, window_height: u32) -> Result<HaarFeature, CascadeError> {
    if let Some(tilted) = find_child(node, "tilted") {
        if tilted.text().map(str::trim) == Some("1") {
            return Err(CascadeError::Unsupported("tilted Haar features".into()));
        }
    }

    let rects = items(child(node, "rects")?)
        .map(|r| {
            let raw = r.text().unwrap_or("");
            let values: Vec<f32> = parse_list(raw, "rects")?;
            let invalid = || CascadeError::InvalidValue {
                element: "rects",
                value: raw.trim().to_string(),
            };
            let [x, y, w, h, weight] = values[..] else {
                return Err(invalid());
            };
            if x < 0.0 || y < 0.0 || w <= 0.0 || h <= 0.0 {
                return Err(invalid());
            }
            let rect = WeightedRect {
                x: x as u32,
                y: y as u32,
                width: w as u32,
                height: h as u32,
                weight,
            };
            if rect.x + rect.width > window_width || rect.y + rect.height > window_height {
                return Err(invalid());
            }
            Ok(rect)
        })
        .collect::<Result<Vec<_>, _>>()?;

    if rects.is_empty() {
        return Err(CascadeError::MissingElement("rects/_"));
    }
    Ok(HaarFeature { rects })
}

fn parse_stage(node: Node, feature_count: usize) -> Result<Stage, CascadeError> {
    let threshold: f32 = parse_scalar(child_text(node, "stageThreshold")?, "stageThreshold")?;

    let stumps = items(child(node, "weakClassifiers")?)
        .map(|weak| {
            let raw_nodes = child_text(weak, "internalNodes")?;
            let nodes: Vec<f64> = parse_list(raw_nodes, "internalNodes")?;
            let leaves: Vec<f32> = parse_list(child_text(weak, "leafValues")?, "leafValues")?;

            if nodes.len() != 4 || leaves.len() != 2 {
                return Err(CascadeError::Unsupported(format!(
                    "weak classifier with {} node values and {} leaves (only stumps are supported)",
                    nodes.len(),
                    leaves.len()
                )));
            }

            let feature = nodes[2];
            if feature < 0.0 || feature as usize >= feature_count {
                return Err(CascadeError::InvalidValue {
                    element: "internalNodes",
                    value: raw_nodes.to_string(),
                });
            }

            Ok(Stump {
                feature: feature as usize,
                threshold: nodes[3] as f32,
                left: leaves[0],
                right: leaves[1],
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if stumps.is_empty() {
        return Err(CascadeError::MissingElement("weakClassifiers/_"));
    }

    Ok(Stage {
        threshold: threshold - STAGE_THRESHOLD_EPS,
        stumps,
    })
}
