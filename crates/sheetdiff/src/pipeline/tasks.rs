//! Work items carried on the bus.
//!
//! Payloads are JSON objects tagged by `mode` (`legacy` | `streaming`) plus a
//! `stage` field naming the stage they belong to. They are decoded exactly
//! once, at the worker boundary.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::WorkerError;
use crate::pipeline::model::{StageKey, StageKind};
use crate::storage::ObjectRef;

pub type Metadata = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OcrTask {
    Legacy {
        job_id: String,
        #[serde(default)]
        metadata: Metadata,
    },
    Streaming {
        job_id: String,
        page_number: u32,
        old_ref: ObjectRef,
        new_ref: ObjectRef,
        #[serde(default)]
        metadata: Metadata,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DiffTask {
    Legacy {
        job_id: String,
        #[serde(default)]
        metadata: Metadata,
    },
    Streaming {
        job_id: String,
        page_number: u32,
        old_ref: ObjectRef,
        new_ref: ObjectRef,
        drawing_name: String,
        #[serde(default)]
        metadata: Metadata,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SummaryTask {
    Legacy {
        job_id: String,
        #[serde(default)]
        metadata: Metadata,
    },
    Streaming {
        job_id: String,
        page_number: u32,
        diff_result_id: String,
        overlay_ref: ObjectRef,
        #[serde(default)]
        metadata: Metadata,
    },
}

/// A bus payload bound to one stage kind.
pub trait StageTask: Serialize + DeserializeOwned + Send {
    const STAGE: StageKind;

    fn job_id(&self) -> &str;

    fn page_number(&self) -> Option<u32>;

    fn key(&self) -> StageKey {
        StageKey {
            job_id: self.job_id().to_string(),
            stage: Self::STAGE,
            page: self.page_number(),
        }
    }
}

macro_rules! impl_stage_task {
    ($ty:ident, $stage:expr) => {
        impl StageTask for $ty {
            const STAGE: StageKind = $stage;

            fn job_id(&self) -> &str {
                match self {
                    $ty::Legacy { job_id, .. } | $ty::Streaming { job_id, .. } => job_id,
                }
            }

            fn page_number(&self) -> Option<u32> {
                match self {
                    $ty::Legacy { .. } => None,
                    $ty::Streaming { page_number, .. } => Some(*page_number),
                }
            }
        }
    };
}

impl_stage_task!(OcrTask, StageKind::Ocr);
impl_stage_task!(DiffTask, StageKind::Diff);
impl_stage_task!(SummaryTask, StageKind::Summary);

pub fn encode<T: StageTask>(task: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut value = serde_json::to_value(task)?;
    if let Value::Object(ref mut map) = value {
        map.insert("stage".to_string(), Value::from(T::STAGE.as_str()));
    }
    serde_json::to_vec(&value)
}

pub fn decode<T: StageTask>(payload: &[u8]) -> Result<T, WorkerError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| WorkerError::MalformedTask(e.to_string()))?;
    let stage = value
        .get("stage")
        .and_then(Value::as_str)
        .ok_or_else(|| WorkerError::MalformedTask("missing 'stage' field".to_string()))?;
    if stage != T::STAGE.as_str() {
        return Err(WorkerError::WrongStage {
            expected: T::STAGE.as_str().to_string(),
            actual: stage.to_string(),
        });
    }
    serde_json::from_value(value).map_err(|e| WorkerError::MalformedTask(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming_diff() -> DiffTask {
        DiffTask::Streaming {
            job_id: "job-1".to_string(),
            page_number: 2,
            old_ref: ObjectRef::new("versions/a/pages/3.png").unwrap(),
            new_ref: ObjectRef::new("versions/b/pages/3.png").unwrap(),
            drawing_name: "A-103".to_string(),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_payload_shape() {
        let bytes = encode(&streaming_diff()).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["mode"], "streaming");
        assert_eq!(value["stage"], "diff");
        assert_eq!(value["old_ref"], "versions/a/pages/3.png");

        let decoded: DiffTask = decode(&bytes).unwrap();
        assert_eq!(decoded, streaming_diff());
        assert_eq!(decoded.key(), StageKey::page("job-1", StageKind::Diff, 2));
    }

    #[test]
    fn test_legacy_metadata_is_optional() {
        let task: SummaryTask =
            decode(br#"{"stage": "summary", "mode": "legacy", "job_id": "j"}"#).unwrap();
        assert_eq!(task.key(), StageKey::job_level("j", StageKind::Summary));
    }

    #[test]
    fn test_wrong_stage_is_rejected() {
        let bytes = encode(&streaming_diff()).unwrap();
        let err = decode::<OcrTask>(&bytes).unwrap_err();
        assert!(matches!(err, WorkerError::WrongStage { .. }));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            decode::<DiffTask>(b"not json"),
            Err(WorkerError::MalformedTask(_))
        ));
        assert!(matches!(
            decode::<DiffTask>(br#"{"stage": "diff", "mode": "sideways"}"#),
            Err(WorkerError::MalformedTask(_))
        ));
        assert!(matches!(
            decode::<DiffTask>(br#"{"stage": "diff", "mode": "streaming", "job_id": "j", "page_number": 1,
                 "old_ref": "../etc/passwd", "new_ref": "a.png", "drawing_name": "x"}"#),
            Err(WorkerError::MalformedTask(_))
        ));
    }
}
