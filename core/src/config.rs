//! Network description sections and network-global options.
//!
//! A network is described by an ordered list of [`Section`]s: the first is the
//! `[net]` record holding global hyperparameters, every following one is a
//! layer. Text parsing of configuration files happens elsewhere; this module
//! only turns already-split records into a [`Network`].

use std::collections::BTreeMap;
use std::str::FromStr;

use tracing::{info, warn};

use crate::error::{NetError, NetResult};
use crate::layers::{
    Activation, ConvolutionalParams, CostType, LayerType, MaxPoolParams, Shape,
};
use crate::model::{Network, NetworkBuilder};

/// One section of a network description: a type tag plus key/value options.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Section {
    tag: String,
    options: BTreeMap<String, String>,
}

impl Section {
    /// Create a section; surrounding brackets (`[net]`) are stripped from the tag.
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.trim().trim_start_matches('[').trim_end_matches(']').to_string(),
            options: BTreeMap::new(),
        }
    }

    /// Builder-style option insert.
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.options.insert(key.to_string(), value.to_string());
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    fn parse<T: FromStr>(&self, key: &str) -> NetResult<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| NetError::InvalidOption {
                section: self.tag.clone(),
                key: key.to_string(),
                value: raw.to_string(),
            }),
        }
    }

    pub fn int(&self, key: &str, default: usize) -> NetResult<usize> {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    pub fn float(&self, key: &str, default: f32) -> NetResult<f32> {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    /// Integer flag: any non-zero value is `true`.
    pub fn flag(&self, key: &str, default: bool) -> NetResult<bool> {
        Ok(self.parse::<i64>(key)?.map_or(default, |v| v != 0))
    }

    pub fn string<'s>(&'s self, key: &str, default: &'s str) -> &'s str {
        self.get(key).map_or(default, str::trim)
    }

    fn is_net(&self) -> bool {
        matches!(self.tag.as_str(), "net" | "network")
    }
}

/// Learning-rate schedule tag. Carried for compatibility; inference ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LearningRatePolicy {
    #[default]
    Constant,
    Step,
    Exp,
    Poly,
    Steps,
    Sig,
    Random,
    Sgdr,
}

impl LearningRatePolicy {
    /// Resolve a policy name; unknown names fall back to `Constant` with a warning.
    pub fn from_name(name: &str) -> Self {
        match name {
            "constant" => Self::Constant,
            "step" => Self::Step,
            "exp" => Self::Exp,
            "poly" => Self::Poly,
            "steps" => Self::Steps,
            "sig" => Self::Sig,
            "random" => Self::Random,
            "sgdr" => Self::Sgdr,
            other => {
                warn!("couldn't find policy {other}, going with constant");
                Self::Constant
            }
        }
    }
}

/// Global hyperparameters fixed when the network is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetOptions {
    /// Mini-batch: samples per forward pass.
    pub batch: usize,
    pub subdivisions: usize,
    pub time_steps: usize,
    pub h: usize,
    pub w: usize,
    pub c: usize,
    pub max_batches: usize,
    pub policy: LearningRatePolicy,
    /// Soft ceiling on the shared workspace, in bytes.
    pub workspace_size_limit: usize,
}

impl Default for NetOptions {
    fn default() -> Self {
        Self {
            batch: 1,
            subdivisions: 1,
            time_steps: 1,
            h: 224,
            w: 224,
            c: 3,
            max_batches: 1_600_000,
            policy: LearningRatePolicy::Poly,
            workspace_size_limit: 1024 * 1024 * 1024,
        }
    }
}

impl NetOptions {
    /// Read a `[net]` section; keys that are absent keep the [`Default`] values.
    pub fn from_section(section: &Section) -> NetResult<Self> {
        let defaults = Self::default();
        let batch = section.int("batch", defaults.batch)?;
        let subdivisions = section.int("subdivisions", defaults.subdivisions)?.max(1);
        let time_steps = section.int("time_steps", defaults.time_steps)?;

        let h = section.int("height", defaults.h)?;
        let w = section.int("width", defaults.w)?;
        let c = section.int("channels", defaults.c)?;
        let image_inputs = h.checked_mul(w).and_then(|hw| hw.checked_mul(c)).ok_or_else(|| {
            NetError::InvalidOption {
                section: section.tag().to_string(),
                key: "height".to_string(),
                value: format!("{h}x{w}x{c} overflows"),
            }
        })?;
        let inputs = section.int("inputs", image_inputs)?;
        if inputs == 0 && !(h > 0 && w > 0 && c > 0) {
            return Err(NetError::NoInputDimensions);
        }
        // A flat, non-image input is carried as 1x1xinputs.
        let (h, w, c) = if h > 0 && w > 0 && c > 0 { (h, w, c) } else { (1, 1, inputs) };

        let batch = (batch / subdivisions).checked_mul(time_steps).ok_or_else(|| NetError::InvalidOption {
            section: section.tag().to_string(),
            key: "time_steps".to_string(),
            value: time_steps.to_string(),
        })?;

        Ok(Self {
            batch,
            subdivisions,
            time_steps,
            h,
            w,
            c,
            max_batches: section.int("max_batches", defaults.max_batches)?,
            policy: LearningRatePolicy::from_name(section.string("policy", "poly")),
            workspace_size_limit: section
                .int("workspace_size_limit_MB", 1024)?
                .saturating_mul(1024 * 1024),
        })
    }

    pub fn input_shape(&self) -> Shape {
        Shape::new(self.h, self.w, self.c)
    }

    /// Elements in one batch element of input.
    pub fn inputs(&self) -> usize {
        self.h * self.w * self.c
    }

    /// Apply caller overrides: a positive `batch` / `time_steps` wins, and the
    /// batch never drops below the number of time steps.
    pub fn apply(&mut self, build: &BuildOptions) {
        if build.batch > 0 {
            self.batch = build.batch;
        }
        if build.time_steps > 0 {
            self.time_steps = build.time_steps;
        }
        self.batch = self.batch.max(1);
        self.time_steps = self.time_steps.max(1);
        if self.batch < self.time_steps {
            self.batch = self.time_steps;
        }
    }
}

/// Caller-side overrides applied while building from sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildOptions {
    /// Replaces the configured mini-batch when non-zero.
    pub batch: usize,
    /// Replaces the configured time steps when non-zero.
    pub time_steps: usize,
    /// Insert a pass-through layer for unknown tags instead of failing.
    pub allow_unknown_layers: bool,
}

fn convolutional_params(section: &Section) -> NetResult<ConvolutionalParams> {
    let size = section.int("size", 1)?;
    let mut padding = section.int("padding", 0)?;
    if section.flag("pad", false)? {
        padding = size / 2;
    }
    Ok(ConvolutionalParams {
        filters: section.int("filters", 1)?,
        groups: section.int("groups", 1)?,
        size,
        stride: section.int("stride", 1)?,
        dilation: section.int("dilation", 1)?,
        padding,
        activation: section.string("activation", "logistic").parse::<Activation>()?,
        batch_normalize: section.flag("batch_normalize", false)?,
    })
}

fn maxpool_params(section: &Section) -> NetResult<MaxPoolParams> {
    let stride = section.int("stride", 1)?;
    let size = section.int("size", stride)?;
    Ok(MaxPoolParams {
        size,
        stride,
        padding: section.int("padding", size.saturating_sub(1))?,
        depthwise: section.flag("maxpool_depth", false)?,
        out_channels: section.int("out_channels", 1)?,
    })
}

/// Build a network from an ordered list of sections.
///
/// The first section must be `[net]`. Each following section is dispatched on
/// its tag and receives the previous layer's output shape as its input shape.
pub fn parse_network(sections: &[Section], build: BuildOptions) -> NetResult<Network> {
    let (net, layers) = sections.split_first().ok_or(NetError::EmptyNetwork)?;
    if !net.is_net() {
        return Err(NetError::MissingNetSection { found: net.tag().to_string() });
    }
    let mut options = NetOptions::from_section(net)?;
    options.apply(&build);
    info!(
        "mini_batch = {}, batch = {}, time_steps = {}",
        options.batch,
        options.batch * options.subdivisions,
        options.time_steps
    );

    let mut builder = NetworkBuilder::new(options);
    for (index, section) in layers.iter().enumerate() {
        match LayerType::from_tag(section.tag()) {
            Some(LayerType::Convolutional) => {
                builder.convolutional(convolutional_params(section)?)?;
            }
            Some(LayerType::MaxPool) => {
                builder.maxpool(maxpool_params(section)?)?;
            }
            Some(LayerType::AvgPool) => {
                builder.avgpool()?;
            }
            Some(LayerType::Softmax) => {
                builder.softmax(section.int("groups", 1)?)?;
            }
            Some(LayerType::Cost) => {
                let cost_type = CostType::from_name(section.string("type", "sse"));
                builder.cost(cost_type, section.float("scale", 1.0)?)?;
            }
            Some(LayerType::Blank) | None if build.allow_unknown_layers => {
                warn!("layer {index}: type not recognized: [{}]", section.tag());
                builder.blank(section.tag())?;
            }
            Some(LayerType::Blank) | None => {
                return Err(NetError::UnknownLayerType {
                    index,
                    tag: section.tag().to_string(),
                });
            }
        }
    }
    builder.build()
}

/// The built-in Tiny Darknet classifier: 224×224×3 input, 1000 classes.
///
/// Layer list matches the published `tiny.weights` file, so
/// `parse_network(&tiny_darknet(), ..)` followed by `load_weights` is enough to
/// run the pretrained model.
pub fn tiny_darknet() -> Vec<Section> {
    let conv = |filters: usize, size: usize| {
        Section::new("convolutional")
            .with("batch_normalize", 1)
            .with("filters", filters)
            .with("size", size)
            .with("stride", 1)
            .with("pad", 1)
            .with("activation", "leaky")
    };
    let maxpool = || {
        Section::new("maxpool")
            .with("size", 2)
            .with("stride", 2)
            .with("padding", 1)
    };

    vec![
        Section::new("net")
            .with("batch", 1)
            .with("subdivisions", 1)
            .with("height", 224)
            .with("width", 224)
            .with("channels", 3)
            .with("max_batches", 1_600_000)
            .with("policy", "poly"),
        conv(16, 3),
        maxpool(),
        conv(32, 3),
        maxpool(),
        conv(16, 1),
        conv(128, 3),
        conv(16, 1),
        conv(128, 3),
        maxpool(),
        conv(32, 1),
        conv(256, 3),
        conv(32, 1),
        conv(256, 3),
        maxpool(),
        conv(64, 1),
        conv(512, 3),
        conv(64, 1),
        conv(512, 3),
        conv(128, 1),
        Section::new("convolutional")
            .with("filters", 1000)
            .with("size", 1)
            .with("stride", 1)
            .with("pad", 1)
            .with("activation", "linear"),
        Section::new("avgpool"),
        Section::new("softmax").with("groups", 1),
        Section::new("cost").with("type", "sse"),
    ]
}
