use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs,
    path::Path,
    str::FromStr,
    sync::Mutex,
};

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Dropout, Linear, VarBuilder};
use tensorflow::{Graph, ImportGraphDefOptions, Session, SessionOptions, SessionRunArgs};
use tracing::info;

use crate::{
    checkpoint::{Checkpoint, FC1_BIAS, FC1_WEIGHT, FC2_BIAS, FC2_WEIGHT},
    config::Config,
    error::{Error, Result},
    preprocess::ImageTensor,
};

/// Pretrained backbones the classifier head can sit on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Vgg13,
    Densenet121,
}

/// Layer sizes of the classifier head for a given backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadSpec {
    pub input_size: usize,
    pub hidden_units: usize,
    pub output_size: usize,
}

impl Arch {
    pub fn name(self) -> &'static str {
        match self {
            Arch::Vgg13 => "vgg13",
            Arch::Densenet121 => "densenet121",
        }
    }

    pub fn head_spec(self) -> HeadSpec {
        match self {
            Arch::Vgg13 => HeadSpec {
                input_size: 25088,
                hidden_units: 4096,
                output_size: 102,
            },
            Arch::Densenet121 => HeadSpec {
                input_size: 1024,
                hidden_units: 500,
                output_size: 102,
            },
        }
    }

    /// Picks the architecture from configuration and the checkpoint's own record.
    pub fn resolve(configured: Option<Arch>, recorded: Option<&str>) -> Result<Arch> {
        let recorded = recorded
            .map(|name| {
                name.parse::<Arch>()
                    .map_err(|e| Error::Checkpoint(format!("recorded arch: {e}")))
            })
            .transpose()?;

        match (configured, recorded) {
            (Some(configured), Some(recorded)) if configured != recorded => {
                Err(Error::ArchitectureMismatch {
                    configured: configured.to_string(),
                    checkpoint: recorded.to_string(),
                })
            }
            (Some(arch), _) | (None, Some(arch)) => Ok(arch),
            (None, None) => Ok(Arch::Vgg13),
        }
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vgg13" => Ok(Arch::Vgg13),
            "densenet121" => Ok(Arch::Densenet121),
            other => Err(format!("unsupported architecture '{other}'")),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Memory layout the backbone graph expects for its image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackboneLayout {
    /// `[1, 3, 224, 224]`, as exported from PyTorch.
    Nchw,
    /// `[1, 224, 224, 3]`, the usual Keras export.
    Nhwc,
}

impl FromStr for BackboneLayout {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nchw" => Ok(BackboneLayout::Nchw),
            "nhwc" => Ok(BackboneLayout::Nhwc),
            other => Err(format!("expected 'nchw' or 'nhwc', got '{other}'")),
        }
    }
}

impl BackboneLayout {
    /// Batch-of-one dims and values of a CHW image in this layout.
    pub fn arrange(self, input: &ImageTensor) -> ([u64; 4], Vec<f32>) {
        let [channels, height, width] = input.shape;
        match self {
            BackboneLayout::Nchw => (
                [1, channels as u64, height as u64, width as u64],
                input.data.clone(),
            ),
            BackboneLayout::Nhwc => {
                let plane = height * width;
                let mut data = Vec::with_capacity(input.data.len());
                for pixel in 0..plane {
                    for channel in 0..channels {
                        data.push(input.data[channel * plane + pixel]);
                    }
                }
                ([1, height as u64, width as u64, channels as u64], data)
            }
        }
    }
}

/// Frozen feature extractor. Produces a flat feature vector per image.
pub trait Backbone: Send + Sync {
    fn features(&self, input: &ImageTensor) -> Result<Vec<f32>>;
}

struct GraphSession {
    session: Session,
    graph: Graph,
}

/// Backbone backed by a frozen TensorFlow graph.
pub struct FrozenGraphBackbone {
    inner: Mutex<GraphSession>,
    input: String,
    output: String,
    layout: BackboneLayout,
}

impl FrozenGraphBackbone {
    pub fn load(
        path: impl AsRef<Path>,
        input: &str,
        output: &str,
        layout: BackboneLayout,
    ) -> Result<Self> {
        let path = path.as_ref();
        let model_bytes = fs::read(path).map_err(|e| Error::io(path, e))?;

        let mut graph = Graph::new();
        graph.import_graph_def(&model_bytes, &ImportGraphDefOptions::new())?;
        // Fail at startup rather than on the first request.
        graph.operation_by_name_required(input)?;
        graph.operation_by_name_required(output)?;

        let session = Session::new(&SessionOptions::new(), &graph)?;
        info!(
            "Loaded backbone graph from {} ({:?} input)",
            path.display(),
            layout
        );

        Ok(Self {
            inner: Mutex::new(GraphSession { session, graph }),
            input: input.to_string(),
            output: output.to_string(),
            layout,
        })
    }
}

impl Backbone for FrozenGraphBackbone {
    fn features(&self, input: &ImageTensor) -> Result<Vec<f32>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::Backbone("session mutex poisoned".into()))?;

        let (dims, data) = self.layout.arrange(input);
        let mut input_tensor = tensorflow::Tensor::<f32>::new(&dims);
        input_tensor.copy_from_slice(&data);

        let input_operation = inner.graph.operation_by_name_required(&self.input)?;
        let output_operation = inner.graph.operation_by_name_required(&self.output)?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&input_operation, 0, &input_tensor);
        let output_token = args.request_fetch(&output_operation, 0);
        inner.session.run(&mut args)?;
        let output_tensor: tensorflow::Tensor<f32> = args.fetch(output_token)?;

        Ok(output_tensor.to_vec())
    }
}

/// fc1 -> ReLU -> Dropout(0.2) -> fc2 -> LogSoftmax.
#[derive(Debug, Clone)]
pub struct Classifier {
    spec: HeadSpec,
    fc1: Linear,
    dropout: Dropout,
    fc2: Linear,
}

impl Classifier {
    pub fn from_checkpoint(checkpoint: &mut Checkpoint, spec: HeadSpec) -> Result<Self> {
        let expected: [(&str, Vec<usize>); 4] = [
            (FC1_WEIGHT, vec![spec.hidden_units, spec.input_size]),
            (FC1_BIAS, vec![spec.hidden_units]),
            (FC2_WEIGHT, vec![spec.output_size, spec.hidden_units]),
            (FC2_BIAS, vec![spec.output_size]),
        ];
        let mut tensors = HashMap::new();
        for (name, shape) in expected {
            tensors.insert(name.to_string(), checkpoint.take(name, &shape)?);
        }

        let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);
        let vb = vb.pp("classifier");
        let fc1 = candle_nn::linear(spec.input_size, spec.hidden_units, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(spec.hidden_units, spec.output_size, vb.pp("fc2"))?;

        Ok(Self {
            spec,
            fc1,
            dropout: Dropout::new(0.2),
            fc2,
        })
    }

    pub fn spec(&self) -> HeadSpec {
        self.spec
    }

    /// Log-probabilities over the output classes.
    pub fn forward(&self, features: &[f32]) -> Result<Vec<f32>> {
        let xs = Tensor::from_slice(features, (1, features.len()), &Device::Cpu)?;
        let hidden = self.fc1.forward(&xs)?.relu()?;
        let hidden = self.dropout.forward(&hidden, false)?;
        let logits = self.fc2.forward(&hidden)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        Ok(log_probs.squeeze(0)?.to_vec1::<f32>()?)
    }
}

pub fn log_softmax(logits: &[f32]) -> Result<Vec<f32>> {
    let xs = Tensor::from_slice(logits, logits.len(), &Device::Cpu)?;
    Ok(candle_nn::ops::log_softmax(&xs, D::Minus1)?.to_vec1::<f32>()?)
}

/// Backbone and head assembled for inference. Immutable after load.
pub struct Model {
    arch: Arch,
    backbone: Box<dyn Backbone>,
    head: Classifier,
    class_to_idx: BTreeMap<String, usize>,
}

impl Model {
    pub fn load(config: &Config) -> Result<Self> {
        let mut checkpoint = Checkpoint::load(&config.checkpoint_path)?;
        let arch = Arch::resolve(config.arch, checkpoint.arch.as_deref())?;
        let head = Classifier::from_checkpoint(&mut checkpoint, arch.head_spec())?;
        let backbone = FrozenGraphBackbone::load(
            &config.backbone_path,
            &config.backbone_input,
            &config.backbone_output,
            config.backbone_layout,
        )?;

        info!(
            "Model ready: {} backbone with a {}-class head",
            arch,
            head.spec().output_size
        );
        Ok(Self::new(arch, Box::new(backbone), head, checkpoint.class_to_idx))
    }

    pub fn new(
        arch: Arch,
        backbone: Box<dyn Backbone>,
        head: Classifier,
        class_to_idx: BTreeMap<String, usize>,
    ) -> Self {
        Self {
            arch,
            backbone,
            head,
            class_to_idx,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn num_classes(&self) -> usize {
        self.head.spec().output_size
    }

    pub fn class_to_idx(&self) -> &BTreeMap<String, usize> {
        &self.class_to_idx
    }

    /// Runs the full network on one image and returns log-probabilities.
    pub fn forward(&self, input: &ImageTensor) -> Result<Vec<f32>> {
        let features = self.backbone.features(input)?;
        let expected = self.head.spec().input_size;
        if features.len() != expected {
            return Err(Error::Backbone(format!(
                "backbone produced {} features, head expects {}",
                features.len(),
                expected
            )));
        }
        self.head.forward(&features)
    }
}
