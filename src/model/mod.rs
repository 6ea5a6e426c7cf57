//! Trained sequence models
//!
//! - `scaler`: fitted min-max feature/target scaling
//! - `lstm`: stacked LSTM forward pass loaded from a JSON state dict
//! - `estimator`: glucose-horizon and sensitivity estimators built on both

pub mod estimator;
pub mod lstm;
pub mod scaler;

pub use estimator::{ModelPaths, ModelStatus, OutputTransform, SequenceEstimator, SequenceModel};
pub use lstm::LstmRegressor;
pub use scaler::MinMaxScaler;
