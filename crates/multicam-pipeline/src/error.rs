use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by the calibration pipeline.
#[derive(Debug, Error)]
pub enum CalibError {
    #[error("ingestion failed for rig {rig}")]
    Ingestion {
        rig: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("need at least 2 stereo rigs, found {found}")]
    InsufficientRigs { found: usize },
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("i/o failure on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("stage '{stage}' failed")]
    Stage {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl CalibError {
    pub fn io(path: impl Into<PathBuf>, source: impl Into<anyhow::Error>) -> Self {
        Self::Io {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// Attach a stage name to an `anyhow` failure.
pub(crate) trait StageContext<T> {
    fn stage(self, stage: &'static str) -> Result<T, CalibError>;
}

impl<T> StageContext<T> for anyhow::Result<T> {
    fn stage(self, stage: &'static str) -> Result<T, CalibError> {
        self.map_err(|source| CalibError::Stage { stage, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn stage_errors_keep_their_source() {
        let res: anyhow::Result<()> = Err(anyhow::anyhow!("solver diverged"));
        let err = res.stage("full_ba").unwrap_err();
        assert_eq!(err.to_string(), "stage 'full_ba' failed");
        assert_eq!(err.source().unwrap().to_string(), "solver diverged");
    }
}
