//! Per-region, per-event prediction models.
//!
//! The backend is chosen once per process from the `PREDICTOR` environment
//! variable. The default, `llsp`, is the built-in linear least-squares
//! model; every other recognised kind is hosted by the external predictor
//! collaborator and driven over a line-delimited JSON protocol.
//!
//! Whatever the backend, the contract is the same: `predict` before any
//! `fit` returns the model's prior (0.0 for `llsp`), and `fit` appends one
//! training example.

mod external;
mod llsp;

pub use external::ExternalModel;
pub use llsp::Llsp;

use crate::events::{EventKind, EVENT_ORDER};
use crate::extract::NR_METRICS;

/// The recognised predictor backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredictorKind {
    Llsp,
    Poly,
    Gpr,
    Nn,
    Svm,
}

impl PredictorKind {
    pub fn name(self) -> &'static str {
        match self {
            PredictorKind::Llsp => "llsp",
            PredictorKind::Poly => "poly",
            PredictorKind::Gpr => "gpr",
            PredictorKind::Nn => "nn",
            PredictorKind::Svm => "svm",
        }
    }

    pub fn from_name(name: &str) -> Option<PredictorKind> {
        match name {
            "llsp" => Some(PredictorKind::Llsp),
            "poly" => Some(PredictorKind::Poly),
            "gpr" => Some(PredictorKind::Gpr),
            "nn" => Some(PredictorKind::Nn),
            "svm" => Some(PredictorKind::Svm),
            _ => None,
        }
    }

    /// The process-wide kind, from `PREDICTOR`. Unknown values fall back
    /// to the default with a warning.
    pub fn from_env() -> PredictorKind {
        match std::env::var("PREDICTOR") {
            Ok(name) => PredictorKind::from_name(&name).unwrap_or_else(|| {
                log::warn!("unknown PREDICTOR {:?}, using llsp", name);
                PredictorKind::Llsp
            }),
            Err(_) => PredictorKind::Llsp,
        }
    }
}

/// One model instance: one event kind of one region.
pub enum Model {
    Llsp(Llsp),
    External(ExternalModel),
}

impl Model {
    pub fn new(kind: PredictorKind) -> Model {
        match kind {
            PredictorKind::Llsp => Model::Llsp(Llsp::new(NR_METRICS)),
            other => Model::External(ExternalModel::create(other)),
        }
    }

    /// The model's current estimate for `features`.
    pub fn predict(&mut self, features: &[f64; NR_METRICS]) -> f64 {
        match self {
            Model::Llsp(m) => m.predict(features),
            Model::External(m) => m.predict(features),
        }
    }

    /// Add one observed training example and refit.
    pub fn fit(&mut self, features: &[f64; NR_METRICS], observed: f64) {
        match self {
            Model::Llsp(m) => {
                m.add(features, observed);
                m.solve();
            }
            Model::External(m) => m.fit(features, observed),
        }
    }
}

/// The three models of one region, in record order.
pub struct EventModels {
    models: Vec<(EventKind, Model)>,
}

impl EventModels {
    pub fn new(kind: PredictorKind) -> EventModels {
        EventModels {
            models: EVENT_ORDER
                .iter()
                .map(|ev| (*ev, Model::new(kind)))
                .collect(),
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EventKind, &mut Model)> {
        self.models.iter_mut().map(|(ev, m)| (*ev, m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            PredictorKind::Llsp,
            PredictorKind::Poly,
            PredictorKind::Gpr,
            PredictorKind::Nn,
            PredictorKind::Svm,
        ] {
            assert_eq!(PredictorKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(PredictorKind::from_name("ridge"), None);
    }

    #[test]
    fn environment_selects_the_backend() {
        std::env::set_var("PREDICTOR", "poly");
        assert_eq!(PredictorKind::from_env(), PredictorKind::Poly);
        std::env::remove_var("PREDICTOR");
        assert_eq!(PredictorKind::from_env(), PredictorKind::Llsp);
    }

    #[test]
    fn fresh_model_predicts_the_prior() {
        let mut model = Model::new(PredictorKind::Llsp);
        assert_eq!(model.predict(&[1.0; NR_METRICS]), 0.0);
    }

    #[test]
    fn event_models_cover_every_event_in_order() {
        let mut models = EventModels::new(PredictorKind::Llsp);
        let kinds: Vec<_> = models.iter_mut().map(|(ev, _)| ev).collect();
        assert_eq!(kinds, EVENT_ORDER);
    }
}
