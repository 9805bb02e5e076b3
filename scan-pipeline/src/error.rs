use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Pipeline stages, in the order they run
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Stage {
    Loader,
    Annotator,
    QualityControl,
    Normalization,
    VarianceModel,
    Integration,
    DimensionReduction,
    Clustering,
    Markers,
    CellTypes,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Loader => "loader",
            Stage::Annotator => "annotator",
            Stage::QualityControl => "quality-control",
            Stage::Normalization => "normalization",
            Stage::VarianceModel => "variance-model",
            Stage::Integration => "integration",
            Stage::DimensionReduction => "dim-reduction",
            Stage::Clustering => "clustering",
            Stage::Markers => "markers",
            Stage::CellTypes => "cell-types",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failures a caller may want to tell apart. These travel inside `anyhow::Error`; recover them
/// with `err.downcast_ref::<PipelineError>()`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    /// A group of cells (a batch, a cluster, the whole dataset) is too small or too empty for
    /// the stage to produce a meaningful result.
    #[error("{stage}: insufficient data for {entity}: {detail}")]
    InsufficientData { stage: Stage, entity: String, detail: String },
}

impl PipelineError {
    /// Build an `InsufficientData` error ready to be returned with `?` or `Err(..)`
    pub fn insufficient(stage: Stage, entity: impl Into<String>, detail: impl Into<String>) -> anyhow::Error {
        PipelineError::InsufficientData {
            stage,
            entity: entity.into(),
            detail: detail.into(),
        }
        .into()
    }

    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::InsufficientData { stage, .. } => *stage,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_downcast_keeps_stage_and_entity() {
        let err = PipelineError::insufficient(Stage::Integration, "batch 'b2'", "12 cells, need at least 21");
        assert_eq!(
            err.to_string(),
            "integration: insufficient data for batch 'b2': 12 cells, need at least 21"
        );
        let typed = err.downcast_ref::<PipelineError>().unwrap();
        assert_eq!(typed.stage(), Stage::Integration);
    }
}
