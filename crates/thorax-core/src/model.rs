//! DenseNet-121 chest radiograph classifier.
//!
//! The backbone follows the torchvision DenseNet-121 layout and parameter
//! naming (`features.denseblock1.denselayer1.norm1.weight`, ...), so weights
//! exported from a pretrained torchvision model as safetensors load directly.
//! The stock 1000-way classifier is replaced by a two-layer head projecting
//! to the diagnostic class count, followed by an elementwise sigmoid: the
//! classes are independent, not mutually exclusive.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{D, DType, Device, Tensor, Var};
use candle_nn::{
    BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Linear, Module, ModuleT, VarBuilder, VarMap,
    batch_norm, conv2d_no_bias, linear, ops,
};
use tracing::debug;

use crate::error::{Result, ThoraxError};

const GROWTH_RATE: usize = 32;
const BN_SIZE: usize = 4;
const BLOCK_LAYERS: [usize; 4] = [6, 12, 24, 16];
const INIT_FEATURES: usize = 64;

/// Feature width produced by the DenseNet-121 backbone.
pub const BACKBONE_WIDTH: usize = 1024;
/// Width of the stock classifier, preserved as the hidden layer of the
/// replaced head.
const HEAD_HIDDEN: usize = 1000;

struct DenseLayer {
    norm1: BatchNorm,
    conv1: Conv2d,
    norm2: BatchNorm,
    conv2: Conv2d,
}

impl DenseLayer {
    fn new(in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let inter = BN_SIZE * GROWTH_RATE;
        let norm1 = batch_norm(in_channels, BatchNormConfig::default(), vb.pp("norm1"))?;
        let conv1 = conv2d_no_bias(
            in_channels,
            inter,
            1,
            Conv2dConfig::default(),
            vb.pp("conv1"),
        )?;
        let norm2 = batch_norm(inter, BatchNormConfig::default(), vb.pp("norm2"))?;
        let conv2 = conv2d_no_bias(
            inter,
            GROWTH_RATE,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv2"),
        )?;
        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let ys = self.norm1.forward_t(xs, train)?.relu()?;
        let ys = self.conv1.forward(&ys)?;
        let ys = self.norm2.forward_t(&ys, train)?.relu()?;
        Ok(self.conv2.forward(&ys)?)
    }
}

struct DenseBlock {
    layers: Vec<DenseLayer>,
}

impl DenseBlock {
    fn new(in_channels: usize, num_layers: usize, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let channels = in_channels + i * GROWTH_RATE;
            layers.push(DenseLayer::new(
                channels,
                vb.pp(format!("denselayer{}", i + 1)),
            )?);
        }
        Ok(Self { layers })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut features = xs.clone();
        for layer in &self.layers {
            let new = layer.forward_t(&features, train)?;
            features = Tensor::cat(&[&features, &new], 1)?;
        }
        Ok(features)
    }
}

struct Transition {
    norm: BatchNorm,
    conv: Conv2d,
}

impl Transition {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let norm = batch_norm(in_channels, BatchNormConfig::default(), vb.pp("norm"))?;
        let conv = conv2d_no_bias(
            in_channels,
            out_channels,
            1,
            Conv2dConfig::default(),
            vb.pp("conv"),
        )?;
        Ok(Self { norm, conv })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let ys = self.norm.forward_t(xs, train)?.relu()?;
        let ys = self.conv.forward(&ys)?;
        Ok(ys.avg_pool2d(2)?)
    }
}

struct DenseNet121 {
    conv0: Conv2d,
    norm0: BatchNorm,
    blocks: Vec<DenseBlock>,
    transitions: Vec<Transition>,
    norm5: BatchNorm,
}

impl DenseNet121 {
    fn new(vb: VarBuilder) -> Result<Self> {
        let conv0 = conv2d_no_bias(
            3,
            INIT_FEATURES,
            7,
            Conv2dConfig {
                stride: 2,
                padding: 3,
                ..Default::default()
            },
            vb.pp("conv0"),
        )?;
        let norm0 = batch_norm(INIT_FEATURES, BatchNormConfig::default(), vb.pp("norm0"))?;

        let mut blocks = Vec::with_capacity(BLOCK_LAYERS.len());
        let mut transitions = Vec::with_capacity(BLOCK_LAYERS.len() - 1);
        let mut channels = INIT_FEATURES;
        for (i, &num_layers) in BLOCK_LAYERS.iter().enumerate() {
            blocks.push(DenseBlock::new(
                channels,
                num_layers,
                vb.pp(format!("denseblock{}", i + 1)),
            )?);
            channels += num_layers * GROWTH_RATE;
            if i + 1 < BLOCK_LAYERS.len() {
                transitions.push(Transition::new(
                    channels,
                    channels / 2,
                    vb.pp(format!("transition{}", i + 1)),
                )?);
                channels /= 2;
            }
        }
        debug_assert_eq!(channels, BACKBONE_WIDTH);
        let norm5 = batch_norm(channels, BatchNormConfig::default(), vb.pp("norm5"))?;

        Ok(Self {
            conv0,
            norm0,
            blocks,
            transitions,
            norm5,
        })
    }

    /// Feature extraction: `[N, 3, H, W]` images to `[N, 1024]` pooled
    /// features. Input sides must be at least 32 pixels.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let ys = self.conv0.forward(xs)?;
        let ys = self.norm0.forward_t(&ys, train)?.relu()?;
        let ys = ys
            .pad_with_zeros(D::Minus1, 1, 1)?
            .pad_with_zeros(D::Minus2, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;

        let mut ys = ys;
        for (i, block) in self.blocks.iter().enumerate() {
            ys = block.forward_t(&ys, train)?;
            if let Some(transition) = self.transitions.get(i) {
                ys = transition.forward_t(&ys, train)?;
            }
        }
        let ys = self.norm5.forward_t(&ys, train)?.relu()?;
        // Global average pool over the spatial dimensions.
        Ok(ys.mean(D::Minus1)?.mean(D::Minus1)?)
    }
}

/// Pretrained backbone plus replaced multi-label classification head.
pub struct ChestClassifier {
    varmap: VarMap,
    backbone: DenseNet121,
    fc1: Linear,
    fc2: Linear,
    device: Device,
    class_count: usize,
}

impl ChestClassifier {
    /// Build a randomly initialized classifier for `class_count` classes on
    /// the given device. Pretrained weights can be applied afterwards with
    /// [`load_pretrained_backbone`](Self::load_pretrained_backbone).
    pub fn new(class_count: usize, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let backbone = DenseNet121::new(vb.pp("features"))?;
        let head = vb.pp("classifier");
        let fc1 = linear(BACKBONE_WIDTH, HEAD_HIDDEN, head.pp("0"))?;
        let fc2 = linear(HEAD_HIDDEN, class_count, head.pp("1"))?;
        Ok(Self {
            varmap,
            backbone,
            fc1,
            fc2,
            device: device.clone(),
            class_count,
        })
    }

    /// Apply tensors from a safetensors file onto matching parameters.
    ///
    /// With `strict` set, every parameter must be covered (checkpoint
    /// restore); without it, unmatched parameters keep their current values
    /// (pretrained backbone import, which has no head weights).
    pub fn apply_weights(&self, tensors: &HashMap<String, Tensor>, strict: bool) -> Result<usize> {
        let data = self.varmap.data().lock().expect("varmap mutex poisoned");
        let mut applied = 0;
        for (name, var) in data.iter() {
            match tensors.get(name) {
                Some(tensor) => {
                    let tensor = tensor.to_device(&self.device)?.to_dtype(var.dtype())?;
                    var.set(&tensor)?;
                    applied += 1;
                }
                None if strict => {
                    return Err(ThoraxError::ModelLoad(format!(
                        "missing parameter {name}"
                    )));
                }
                None => {}
            }
        }
        Ok(applied)
    }

    /// Load pretrained backbone weights from a safetensors file, leaving the
    /// replaced head at its fresh initialization.
    pub fn load_pretrained_backbone(&self, path: &Path) -> Result<usize> {
        let tensors = candle_core::safetensors::load(path, &self.device)?;
        let applied = self.apply_weights(&tensors, false)?;
        if applied == 0 {
            return Err(ThoraxError::ModelLoad(format!(
                "no parameter names in {} match the model",
                path.display()
            )));
        }
        debug!(applied, path = %path.display(), "pretrained backbone weights applied");
        Ok(applied)
    }

    /// Pre-sigmoid activations, `[N, class_count]`. The trainer feeds these
    /// to the numerically stable BCE-with-logits loss.
    pub fn forward_logits_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let features = self.backbone.forward_t(xs, train)?;
        let ys = self.fc1.forward(&features)?;
        Ok(self.fc2.forward(&ys)?)
    }

    /// Per-class probabilities in `[0, 1]`, `[N, class_count]`.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let logits = self.forward_logits_t(xs, train)?;
        Ok(ops::sigmoid(&logits)?)
    }

    /// All trainable parameters, sorted by name for a stable optimizer slot
    /// order.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().expect("varmap mutex poisoned");
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    /// The backing parameter store, used for checkpoint persistence.
    pub fn var_map(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn class_count(&self) -> usize {
        self.class_count
    }
}
