//! Stacked LSTM regressor
//!
//! Inference-only forward pass of a multi-layer LSTM followed by a linear head
//! on the final hidden state of the last layer:
//!
//! ```text
//! i_t = σ(W_ii x_t + b_ii + W_hi h_{t-1} + b_hi)
//! f_t = σ(W_if x_t + b_if + W_hf h_{t-1} + b_hf)
//! g_t = tanh(W_ig x_t + b_ig + W_hg h_{t-1} + b_hg)
//! o_t = σ(W_io x_t + b_io + W_ho h_{t-1} + b_ho)
//! c_t = f_t * c_{t-1} + i_t * g_t
//! h_t = o_t * tanh(c_t)
//! y   = W_fc h_T + b_fc
//! ```
//!
//! Weights come from a JSON state dict with keys `lstm.weight_ih_l{k}`,
//! `lstm.weight_hh_l{k}`, `lstm.bias_ih_l{k}`, `lstm.bias_hh_l{k}`, `fc.weight`
//! and `fc.bias`. Gate blocks are stacked in the order input, forget, cell, output.

use crate::error::{ForecastError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// A tensor as stored in the state dict
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Tensor {
    Vector(Vec<f64>),
    Matrix(Vec<Vec<f64>>),
}

/// Dense row-major matrix
#[derive(Debug, Clone, PartialEq)]
struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    fn from_rows(name: &str, rows: Vec<Vec<f64>>) -> Result<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if rows.is_empty() || cols == 0 || rows.iter().any(|r| r.len() != cols) {
            return Err(ForecastError::ModelFormat(format!(
                "{name} is not a rectangular, non-empty matrix"
            )));
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data: rows.into_iter().flatten().collect(),
        })
    }

    /// `out += self * x`
    fn mul_add(&self, x: &[f64], out: &mut [f64]) {
        for (r, o) in out.iter_mut().enumerate().take(self.rows) {
            let row = &self.data[r * self.cols..(r + 1) * self.cols];
            *o += row.iter().zip(x).map(|(w, v)| w * v).sum::<f64>();
        }
    }
}

#[derive(Debug, Clone)]
struct LstmLayer {
    w_ih: Matrix,
    w_hh: Matrix,
    /// Combined `b_ih + b_hh`
    bias: Vec<f64>,
}

impl LstmLayer {
    fn hidden_size(&self) -> usize {
        self.w_hh.cols
    }

    fn input_size(&self) -> usize {
        self.w_ih.cols
    }

    fn step(&self, x: &[f64], h: &mut [f64], c: &mut [f64]) {
        let hidden = self.hidden_size();
        let mut gates = self.bias.clone();
        self.w_ih.mul_add(x, &mut gates);
        self.w_hh.mul_add(h, &mut gates);

        for j in 0..hidden {
            let i = sigmoid(gates[j]);
            let f = sigmoid(gates[hidden + j]);
            let g = gates[2 * hidden + j].tanh();
            let o = sigmoid(gates[3 * hidden + j]);
            c[j] = f * c[j] + i * g;
            h[j] = o * c[j].tanh();
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Multi-layer LSTM with a linear output head
#[derive(Debug, Clone)]
pub struct LstmRegressor {
    layers: Vec<LstmLayer>,
    fc_weight: Matrix,
    fc_bias: Vec<f64>,
}

impl LstmRegressor {
    /// Load weights from a JSON state-dict file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Build the network from a JSON state dict; sizes are inferred from the tensors
    pub fn from_json(json: &str) -> Result<Self> {
        let mut dict: BTreeMap<String, Tensor> = serde_json::from_str(json)?;

        let mut layers = Vec::new();
        while dict.contains_key(&format!("lstm.weight_ih_l{}", layers.len())) {
            let k = layers.len();
            let w_ih = take_matrix(&mut dict, &format!("lstm.weight_ih_l{k}"))?;
            let w_hh = take_matrix(&mut dict, &format!("lstm.weight_hh_l{k}"))?;
            let b_ih = take_vector(&mut dict, &format!("lstm.bias_ih_l{k}"))?;
            let b_hh = take_vector(&mut dict, &format!("lstm.bias_hh_l{k}"))?;

            let hidden = w_hh.cols;
            let gates = 4 * hidden;
            if w_hh.rows != gates
                || w_ih.rows != gates
                || b_ih.len() != gates
                || b_hh.len() != gates
            {
                return Err(ForecastError::ModelFormat(format!(
                    "layer {k} gate tensors do not match hidden size {hidden}"
                )));
            }
            if let Some(prev) = layers.last().map(LstmLayer::hidden_size) {
                if w_ih.cols != prev {
                    return Err(ForecastError::ModelFormat(format!(
                        "layer {k} expects {} inputs but layer {} emits {prev}",
                        w_ih.cols,
                        k - 1
                    )));
                }
            }

            let bias = b_ih.iter().zip(&b_hh).map(|(a, b)| a + b).collect();
            layers.push(LstmLayer { w_ih, w_hh, bias });
        }

        let Some(last_hidden) = layers.last().map(LstmLayer::hidden_size) else {
            return Err(ForecastError::ModelFormat(
                "state dict has no lstm.weight_ih_l0".to_string(),
            ));
        };

        let fc_weight = take_matrix(&mut dict, "fc.weight")?;
        let fc_bias = take_vector(&mut dict, "fc.bias")?;
        if fc_weight.cols != last_hidden || fc_bias.len() != fc_weight.rows {
            return Err(ForecastError::ModelFormat(format!(
                "fc head is {}x{} with {} biases, hidden size is {last_hidden}",
                fc_weight.rows,
                fc_weight.cols,
                fc_bias.len()
            )));
        }

        Ok(Self {
            layers,
            fc_weight,
            fc_bias,
        })
    }

    /// Features per time step
    pub fn input_size(&self) -> usize {
        self.layers.first().map(LstmLayer::input_size).unwrap_or(0)
    }

    pub fn hidden_size(&self) -> usize {
        self.layers.first().map(LstmLayer::hidden_size).unwrap_or(0)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of regression outputs
    pub fn output_size(&self) -> usize {
        self.fc_weight.rows
    }

    /// Run the sequence (oldest step first) and return the head's outputs
    pub fn forward<R: AsRef<[f64]>>(&self, sequence: &[R]) -> Result<Vec<f64>> {
        if sequence.is_empty() {
            return Err(ForecastError::ShapeMismatch("empty input sequence".to_string()));
        }

        let mut hidden: Vec<Vec<f64>> = self
            .layers
            .iter()
            .map(|l| vec![0.0; l.hidden_size()])
            .collect();
        let mut cell = hidden.clone();

        for (t, row) in sequence.iter().enumerate() {
            let x = row.as_ref();
            if x.len() != self.input_size() {
                return Err(ForecastError::ShapeMismatch(format!(
                    "step {t} has {} features, network expects {}",
                    x.len(),
                    self.input_size()
                )));
            }

            let mut input = x.to_vec();
            for (k, layer) in self.layers.iter().enumerate() {
                layer.step(&input, &mut hidden[k], &mut cell[k]);
                input.clone_from(&hidden[k]);
            }
        }

        let last = hidden.last().map(Vec::as_slice).unwrap_or(&[]);
        let mut out = self.fc_bias.clone();
        self.fc_weight.mul_add(last, &mut out);

        if out.iter().any(|v| !v.is_finite()) {
            return Err(ForecastError::Inference(
                "network produced a non-finite output".to_string(),
            ));
        }
        Ok(out)
    }
}

fn take_matrix(dict: &mut BTreeMap<String, Tensor>, name: &str) -> Result<Matrix> {
    match dict.remove(name) {
        Some(Tensor::Matrix(rows)) => Matrix::from_rows(name, rows),
        Some(Tensor::Vector(_)) => Err(ForecastError::ModelFormat(format!("{name} must be 2-D"))),
        None => Err(ForecastError::ModelFormat(format!("missing tensor {name}"))),
    }
}

fn take_vector(dict: &mut BTreeMap<String, Tensor>, name: &str) -> Result<Vec<f64>> {
    match dict.remove(name) {
        Some(Tensor::Vector(values)) => Ok(values),
        Some(Tensor::Matrix(_)) => Err(ForecastError::ModelFormat(format!("{name} must be 1-D"))),
        None => Err(ForecastError::ModelFormat(format!("missing tensor {name}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// One layer, one input, one hidden unit; only the cell-candidate weight is set
    fn tiny() -> String {
        json!({
            "lstm.weight_ih_l0": [[0.0], [0.0], [1.0], [0.0]],
            "lstm.weight_hh_l0": [[0.0], [0.0], [0.0], [0.0]],
            "lstm.bias_ih_l0": [0.0, 0.0, 0.0, 0.0],
            "lstm.bias_hh_l0": [0.0, 0.0, 0.0, 0.0],
            "fc.weight": [[1.0]],
            "fc.bias": [0.0]
        })
        .to_string()
    }

    #[test]
    fn test_single_step_matches_gate_equations() {
        let net = LstmRegressor::from_json(&tiny()).unwrap();
        assert_eq!(net.input_size(), 1);
        assert_eq!(net.hidden_size(), 1);
        assert_eq!(net.num_layers(), 1);

        let out = net.forward(&[[1.0]]).unwrap();
        let c = 0.5 * 1.0_f64.tanh();
        let expected = 0.5 * c.tanh();
        assert!((out[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_zero_weights_yield_bias() {
        let zeros4 = vec![vec![0.0; 2]; 4];
        let zero_bias = vec![0.0; 4];
        let dict = json!({
            "lstm.weight_ih_l0": zeros4,
            "lstm.weight_hh_l0": [[0.0], [0.0], [0.0], [0.0]],
            "lstm.bias_ih_l0": zero_bias,
            "lstm.bias_hh_l0": zero_bias,
            "lstm.weight_ih_l1": [[0.0], [0.0], [0.0], [0.0]],
            "lstm.weight_hh_l1": [[0.0], [0.0], [0.0], [0.0]],
            "lstm.bias_ih_l1": zero_bias,
            "lstm.bias_hh_l1": zero_bias,
            "fc.weight": [[0.0], [0.0], [0.0]],
            "fc.bias": [1.0, 2.0, 3.0]
        });
        let net = LstmRegressor::from_json(&dict.to_string()).unwrap();
        assert_eq!(net.num_layers(), 2);
        assert_eq!(net.output_size(), 3);

        let out = net.forward(&[[0.3, 0.7], [0.1, 0.2]]).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let mut dict: serde_json::Value = serde_json::from_str(&tiny()).unwrap();
        dict["fc.weight"] = json!([[1.0, 1.0]]);
        assert!(matches!(
            LstmRegressor::from_json(&dict.to_string()),
            Err(ForecastError::ModelFormat(_))
        ));

        assert!(LstmRegressor::from_json(r#"{"fc.weight": [[1.0]], "fc.bias": [0.0]}"#).is_err());
    }

    #[test]
    fn test_input_width_checked() {
        let net = LstmRegressor::from_json(&tiny()).unwrap();
        assert!(matches!(
            net.forward(&[[1.0, 2.0]]),
            Err(ForecastError::ShapeMismatch(_))
        ));
        let empty: [[f64; 1]; 0] = [];
        assert!(net.forward(&empty).is_err());
    }
}
