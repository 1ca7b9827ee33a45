//! Dense feed-forward networks and their concrete evaluation.
//!
//! A [`Network`] is an ordered list of fully-connected layers. Each layer
//! computes `act(W·x + b)` where `act` is either the identity or ReLU. The
//! final layer is the output layer and is always affine.

use crate::{CoreError, Result};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Activation applied after a layer's affine map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Identity,
    Relu,
}

impl Activation {
    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Identity => x,
            Activation::Relu => x.max(0.0),
        }
    }

    /// Whether this activation is piecewise-linear with a case split.
    pub fn is_piecewise_linear(self) -> bool {
        matches!(self, Activation::Relu)
    }
}

/// Address of a single unit (neuron) in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
    /// Layer index (0-based, over the network's layers).
    pub layer: usize,
    /// Unit index inside the layer.
    pub unit: usize,
}

impl UnitId {
    pub fn new(layer: usize, unit: usize) -> Self {
        Self { layer, unit }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}:{}", self.layer, self.unit)
    }
}

/// A fully-connected layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    /// Weight matrix, shape (units, inputs).
    pub weights: Array2<f64>,
    /// Bias vector, shape (units).
    pub bias: Array1<f64>,
    pub activation: Activation,
    /// Optional spatial shape of the layer's units (e.g. `[c, h, w]`).
    pub shape: Option<Vec<usize>>,
}

impl Layer {
    /// Create a layer, checking that weights and bias agree.
    pub fn new(weights: Array2<f64>, bias: Array1<f64>, activation: Activation) -> Result<Self> {
        if weights.nrows() != bias.len() {
            return Err(CoreError::ShapeMismatch(format!(
                "weights have {} rows but bias has {} entries",
                weights.nrows(),
                bias.len()
            )));
        }
        Ok(Self {
            weights,
            bias,
            activation,
            shape: None,
        })
    }

    /// Attach a spatial shape to the layer's units.
    pub fn with_shape(mut self, shape: Vec<usize>) -> Result<Self> {
        let total: usize = shape.iter().product();
        if total != self.units() {
            return Err(CoreError::ShapeMismatch(format!(
                "shape {:?} has {} elements but layer has {} units",
                shape,
                total,
                self.units()
            )));
        }
        self.shape = Some(shape);
        Ok(self)
    }

    /// Number of units (outputs) of this layer.
    pub fn units(&self) -> usize {
        self.weights.nrows()
    }

    /// Number of inputs consumed by this layer.
    pub fn inputs(&self) -> usize {
        self.weights.ncols()
    }

    /// Pre-activation values `W·x + b`.
    pub fn affine(&self, input: ArrayView1<'_, f64>) -> Array1<f64> {
        self.weights.dot(&input) + &self.bias
    }

    /// Post-activation values.
    pub fn forward(&self, input: ArrayView1<'_, f64>) -> Array1<f64> {
        let activation = self.activation;
        self.affine(input).mapv_into(|v| activation.apply(v))
    }
}

/// A feed-forward network.
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    layers: Vec<Layer>,
}

impl Network {
    /// Build a network, validating the layer chain.
    pub fn new(layers: Vec<Layer>) -> Result<Self> {
        let Some(last) = layers.last() else {
            return Err(CoreError::InvalidNetwork("network has no layers".to_string()));
        };
        if last.activation != Activation::Identity {
            return Err(CoreError::InvalidNetwork(
                "output layer must use the identity activation".to_string(),
            ));
        }
        for (idx, pair) in layers.windows(2).enumerate() {
            if pair[0].units() != pair[1].inputs() {
                return Err(CoreError::ShapeMismatch(format!(
                    "layer {} produces {} units but layer {} expects {} inputs",
                    idx,
                    pair[0].units(),
                    idx + 1,
                    pair[1].inputs()
                )));
            }
        }
        if layers.iter().any(|l| l.units() == 0) {
            return Err(CoreError::InvalidNetwork("layer with zero units".to_string()));
        }
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn input_dim(&self) -> usize {
        self.layers[0].inputs()
    }

    pub fn output_dim(&self) -> usize {
        self.layers[self.layers.len() - 1].units()
    }

    /// Hidden units that may be abstracted: every unit of a non-final ReLU layer.
    pub fn abstractable_units(&self) -> Vec<UnitId> {
        let last = self.layers.len() - 1;
        self.layers
            .iter()
            .enumerate()
            .filter(|(idx, layer)| *idx < last && layer.activation.is_piecewise_linear())
            .flat_map(|(idx, layer)| (0..layer.units()).map(move |u| UnitId::new(idx, u)))
            .collect()
    }

    /// Whether a unit is abstractable in this network.
    pub fn is_abstractable(&self, unit: UnitId) -> bool {
        unit.layer + 1 < self.layers.len()
            && self.layers[unit.layer].activation.is_piecewise_linear()
            && unit.unit < self.layers[unit.layer].units()
    }

    /// Evaluate the network on a concrete input.
    pub fn evaluate(&self, input: &[f64]) -> Result<Vec<f64>> {
        let mut activations = self.activations(input)?;
        Ok(activations.pop().unwrap_or_default())
    }

    /// Post-activation values of every layer on a concrete input.
    pub fn activations(&self, input: &[f64]) -> Result<Vec<Vec<f64>>> {
        if input.len() != self.input_dim() {
            return Err(CoreError::ShapeMismatch(format!(
                "network expects {} inputs, got {}",
                self.input_dim(),
                input.len()
            )));
        }
        let mut current = Array1::from(input.to_vec());
        let mut out = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            current = layer.forward(current.view());
            out.push(current.to_vec());
        }
        Ok(out)
    }

    /// Index of the largest output (ties resolved towards the lowest index).
    pub fn predicted_class(&self, input: &[f64]) -> Result<usize> {
        let output = self.evaluate(input)?;
        Ok(argmax(&output))
    }

    /// Load a network from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CoreError::Load {
            what: path.display().to_string(),
            message: e.to_string(),
        })?;
        let network = Self::from_json(&text)?;
        debug!(
            path = %path.display(),
            layers = network.num_layers(),
            inputs = network.input_dim(),
            outputs = network.output_dim(),
            "Loaded network"
        );
        Ok(network)
    }

    /// Parse a network from its JSON representation.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: NetworkFile = serde_json::from_str(text).map_err(|e| CoreError::Load {
            what: "network".to_string(),
            message: e.to_string(),
        })?;
        file.into_network()
    }
}

pub(crate) fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (idx, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = idx;
        }
    }
    best
}

/// On-disk layer description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerFile {
    /// Row-major weights: one row per unit.
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    pub activation: Activation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<usize>>,
}

/// On-disk network description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkFile {
    pub layers: Vec<LayerFile>,
}

impl NetworkFile {
    pub fn into_network(self) -> Result<Network> {
        let mut layers = Vec::with_capacity(self.layers.len());
        for (idx, lf) in self.layers.into_iter().enumerate() {
            let rows = lf.weights.len();
            let cols = lf.weights.first().map_or(0, Vec::len);
            if lf.weights.iter().any(|r| r.len() != cols) {
                return Err(CoreError::ShapeMismatch(format!(
                    "layer {idx}: ragged weight matrix"
                )));
            }
            let flat: Vec<f64> = lf.weights.into_iter().flatten().collect();
            let weights = Array2::from_shape_vec((rows, cols), flat)
                .map_err(|e| CoreError::ShapeMismatch(format!("layer {idx}: {e}")))?;
            let mut layer = Layer::new(weights, Array1::from(lf.bias), lf.activation)?;
            if let Some(shape) = lf.shape {
                layer = layer.with_shape(shape)?;
            }
            layers.push(layer);
        }
        Network::new(layers)
    }
}

impl From<&Network> for NetworkFile {
    fn from(network: &Network) -> Self {
        Self {
            layers: network
                .layers
                .iter()
                .map(|l| LayerFile {
                    weights: l.weights.rows().into_iter().map(|r| r.to_vec()).collect(),
                    bias: l.bias.to_vec(),
                    activation: l.activation,
                    shape: l.shape.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn two_layer() -> Network {
        let hidden = Layer::new(
            arr2(&[[1.0, -1.0], [1.0, 1.0]]),
            arr1(&[0.0, -1.0]),
            Activation::Relu,
        )
        .unwrap();
        let out = Layer::new(
            arr2(&[[1.0, 0.0], [0.0, 1.0]]),
            arr1(&[0.0, 0.5]),
            Activation::Identity,
        )
        .unwrap();
        Network::new(vec![hidden, out]).unwrap()
    }

    #[test]
    fn test_evaluate_relu_network() {
        let net = two_layer();
        // hidden = relu([1-2, 1+2-1]) = [0, 2]; out = [0, 2.5]
        let out = net.evaluate(&[1.0, 2.0]).unwrap();
        assert_eq!(out, vec![0.0, 2.5]);
        assert_eq!(net.predicted_class(&[1.0, 2.0]).unwrap(), 1);
    }

    #[test]
    fn test_activations_per_layer() {
        let net = two_layer();
        let acts = net.activations(&[1.0, 2.0]).unwrap();
        assert_eq!(acts.len(), 2);
        assert_eq!(acts[0], vec![0.0, 2.0]);
    }

    #[test]
    fn test_evaluate_wrong_arity() {
        let net = two_layer();
        assert!(matches!(
            net.evaluate(&[1.0]),
            Err(CoreError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_abstractable_units() {
        let net = two_layer();
        let units = net.abstractable_units();
        assert_eq!(units, vec![UnitId::new(0, 0), UnitId::new(0, 1)]);
        assert!(net.is_abstractable(UnitId::new(0, 1)));
        assert!(!net.is_abstractable(UnitId::new(1, 0)));
        assert!(!net.is_abstractable(UnitId::new(0, 2)));
    }

    #[test]
    fn test_network_rejects_relu_output() {
        let layer = Layer::new(arr2(&[[1.0]]), arr1(&[0.0]), Activation::Relu).unwrap();
        assert!(matches!(
            Network::new(vec![layer]),
            Err(CoreError::InvalidNetwork(_))
        ));
    }

    #[test]
    fn test_network_rejects_dimension_mismatch() {
        let a = Layer::new(arr2(&[[1.0, 1.0]]), arr1(&[0.0]), Activation::Relu).unwrap();
        let b = Layer::new(arr2(&[[1.0, 1.0]]), arr1(&[0.0]), Activation::Identity).unwrap();
        assert!(matches!(
            Network::new(vec![a, b]),
            Err(CoreError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_layer_bias_mismatch() {
        let err = Layer::new(arr2(&[[1.0, 1.0]]), arr1(&[0.0, 1.0]), Activation::Relu);
        assert!(err.is_err());
    }

    #[test]
    fn test_network_json_roundtrip() {
        let json = r#"{
            "layers": [
                {"weights": [[1.0, -1.0], [1.0, 1.0]], "bias": [0.0, -1.0], "activation": "relu"},
                {"weights": [[1.0, 0.0], [0.0, 1.0]], "bias": [0.0, 0.5], "activation": "identity"}
            ]
        }"#;
        let net = Network::from_json(json).unwrap();
        assert_eq!(net, two_layer());
        let file = NetworkFile::from(&net);
        let again = file.into_network().unwrap();
        assert_eq!(again, net);
    }

    #[test]
    fn test_network_json_ragged_weights() {
        let json = r#"{"layers": [
            {"weights": [[1.0], [1.0, 2.0]], "bias": [0.0, 0.0], "activation": "identity"}
        ]}"#;
        assert!(Network::from_json(json).is_err());
    }

    #[test]
    fn test_layer_shape_checked() {
        let layer = Layer::new(
            arr2(&[[1.0], [1.0], [1.0], [1.0]]),
            arr1(&[0.0; 4]),
            Activation::Relu,
        )
        .unwrap();
        assert!(layer.clone().with_shape(vec![2, 2]).is_ok());
        assert!(layer.with_shape(vec![3]).is_err());
    }
}
