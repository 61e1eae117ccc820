// 该文件是 Zhiyin （指引） 项目的一部分。
// src/processor.rs - 处理器
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{cmp::Ordering, collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::frame::{BgrFrame, FrameError};

/// 处理器：把一帧图像映射为一份观测
pub trait Processor {
  fn infer(&self, frame: &BgrFrame) -> Result<Observation, ProcessorError>;

  /// 构造时记录的参数，是相等比较与序列化的唯一依据
  fn spec(&self) -> ProcessorSpec;
}

#[derive(Error, Debug)]
pub enum ProcessorError {
  #[error("模型加载错误: {path}: {reason}")]
  ModelLoad { path: PathBuf, reason: String },
  #[error("输入帧无效: {0}")]
  InvalidInput(#[from] FrameError),
  #[error("未注册的处理器类型: {0}")]
  UnknownProcessorType(String),
  #[error("处理器 {kind} 参数无效: {reason}")]
  InvalidSpec { kind: String, reason: String },
  #[error("处理器 {0} 未编译进当前构建，请启用 onnx 特性")]
  Unsupported(String),
  #[error("推理错误: {0}")]
  Inference(String),
}

impl ProcessorError {
  pub fn model_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
    ProcessorError::ModelLoad {
      path: path.into(),
      reason: reason.to_string(),
    }
  }

  pub fn invalid_spec(kind: &str, reason: impl ToString) -> Self {
    ProcessorError::InvalidSpec {
      kind: kind.to_string(),
      reason: reason.to_string(),
    }
  }
}

/// 处理器的可序列化描述：类型名与构造参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorSpec {
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(default)]
  pub args: Map<String, Value>,
}

impl ProcessorSpec {
  pub fn new(kind: impl Into<String>, args: Map<String, Value>) -> Self {
    Self {
      kind: kind.into(),
      args,
    }
  }

  /// 参数表按键排序，因此同一描述总得到同一个键
  pub fn canonical_key(&self) -> String {
    format!("{}:{}", self.kind, Value::Object(self.args.clone()))
  }

  pub(crate) fn decode_args<T: DeserializeOwned>(&self) -> Result<T, ProcessorError> {
    serde_json::from_value(Value::Object(self.args.clone()))
      .map_err(|e| ProcessorError::invalid_spec(&self.kind, e))
  }

  pub(crate) fn encode<T: Serialize>(kind: &str, config: &T) -> Result<Self, ProcessorError> {
    match serde_json::to_value(config) {
      Ok(Value::Object(args)) => Ok(ProcessorSpec::new(kind, args)),
      Ok(other) => Err(ProcessorError::invalid_spec(
        kind,
        format!("参数必须是对象, 实际为 {other}"),
      )),
      Err(e) => Err(ProcessorError::invalid_spec(kind, e)),
    }
  }
}

/// 单个检测结果，序列化为 `[left, top, right, bottom, confidence, class_id]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(
  from = "(f32, f32, f32, f32, f32, u32)",
  into = "(f32, f32, f32, f32, f32, u32)"
)]
pub struct Detection {
  pub left: f32,
  pub top: f32,
  pub right: f32,
  pub bottom: f32,
  pub confidence: f32,
  pub class_id: u32,
}

impl From<(f32, f32, f32, f32, f32, u32)> for Detection {
  fn from((left, top, right, bottom, confidence, class_id): (f32, f32, f32, f32, f32, u32)) -> Self {
    Self {
      left,
      top,
      right,
      bottom,
      confidence,
      class_id,
    }
  }
}

impl From<Detection> for (f32, f32, f32, f32, f32, u32) {
  fn from(d: Detection) -> Self {
    (d.left, d.top, d.right, d.bottom, d.confidence, d.class_id)
  }
}

impl Detection {
  fn total_cmp(&self, other: &Self) -> Ordering {
    self
      .left
      .total_cmp(&other.left)
      .then(self.top.total_cmp(&other.top))
      .then(self.right.total_cmp(&other.right))
      .then(self.bottom.total_cmp(&other.bottom))
      .then(self.confidence.total_cmp(&other.confidence))
      .then(self.class_id.cmp(&other.class_id))
  }
}

/// 一帧的观测：类别名到检测列表的映射
///
/// 缺少某个键等价于该类别没有检测结果；列表内顺序没有意义，
/// 比较时按集合处理。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Observation {
  classes: BTreeMap<String, Vec<Detection>>,
}

impl Observation {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, class_name: impl Into<String>, detection: Detection) {
    self
      .classes
      .entry(class_name.into())
      .or_default()
      .push(detection);
  }

  pub fn with(mut self, class_name: impl Into<String>, detection: Detection) -> Self {
    self.push(class_name, detection);
    self
  }

  pub fn get(&self, class_name: &str) -> &[Detection] {
    self
      .classes
      .get(class_name)
      .map(Vec::as_slice)
      .unwrap_or_default()
  }

  pub fn contains(&self, class_name: &str) -> bool {
    !self.get(class_name).is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &[Detection])> {
    self
      .classes
      .iter()
      .filter(|(_, dets)| !dets.is_empty())
      .map(|(name, dets)| (name.as_str(), dets.as_slice()))
  }

  /// 检测总数
  pub fn len(&self) -> usize {
    self.classes.values().map(Vec::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn sorted(&self) -> Vec<(&str, Vec<Detection>)> {
    self
      .iter()
      .map(|(name, dets)| {
        let mut dets = dets.to_vec();
        dets.sort_by(Detection::total_cmp);
        (name, dets)
      })
      .collect()
  }
}

impl PartialEq for Observation {
  fn eq(&self, other: &Self) -> bool {
    let (a, b) = (self.sorted(), other.sorted());
    a.len() == b.len()
      && a.iter().zip(b.iter()).all(|((na, da), (nb, db))| {
        na == nb
          && da.len() == db.len()
          && da
            .iter()
            .zip(db.iter())
            .all(|(x, y)| x.total_cmp(y) == Ordering::Equal)
      })
  }
}

/// 已注册处理器的统一封装
pub enum ProcessorWrapper {
  Dummy(DummyProcessor),
  #[cfg(feature = "onnx")]
  Detector(Detector<OnnxBackend>),
}

impl Processor for ProcessorWrapper {
  fn infer(&self, frame: &BgrFrame) -> Result<Observation, ProcessorError> {
    match self {
      ProcessorWrapper::Dummy(processor) => processor.infer(frame),
      #[cfg(feature = "onnx")]
      ProcessorWrapper::Detector(processor) => processor.infer(frame),
    }
  }

  fn spec(&self) -> ProcessorSpec {
    match self {
      ProcessorWrapper::Dummy(processor) => processor.spec(),
      #[cfg(feature = "onnx")]
      ProcessorWrapper::Detector(processor) => processor.spec(),
    }
  }
}

impl PartialEq for ProcessorWrapper {
  fn eq(&self, other: &Self) -> bool {
    self.spec() == other.spec()
  }
}

impl std::fmt::Debug for ProcessorWrapper {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("ProcessorWrapper").field(&self.spec()).finish()
  }
}

mod dummy;
pub use self::dummy::{DummyConfig, DummyProcessor};

mod detector;
pub use self::detector::{
  DetectItem, Detector, DetectorConfig, InferenceBackend, RawDetections, ScalePolicy,
  filter_by_confidence, iou, nms,
};

#[cfg(feature = "onnx")]
mod onnx;
#[cfg(feature = "onnx")]
pub use self::onnx::{OnnxBackend, OutputLayout};

#[cfg(feature = "debug_draw")]
mod draw;
#[cfg(feature = "debug_draw")]
pub use self::draw::DebugRecorder;

mod registry;
pub use self::registry::{BuildProcessor, ProcessorKind, Registry, serialize};

#[cfg(test)]
mod tests {
  use super::*;

  fn det(left: f32, confidence: f32) -> Detection {
    Detection {
      left,
      top: 0.0,
      right: left + 10.0,
      bottom: 10.0,
      confidence,
      class_id: 0,
    }
  }

  #[test]
  fn observation_ignores_order_within_class() {
    let a = Observation::new()
      .with("cup", det(0.0, 0.9))
      .with("cup", det(20.0, 0.85));
    let b = Observation::new()
      .with("cup", det(20.0, 0.85))
      .with("cup", det(0.0, 0.9));
    assert_eq!(a, b);
  }

  #[test]
  fn missing_class_equals_empty_class() {
    let mut a = Observation::new();
    a.classes.insert("cup".to_string(), Vec::new());
    assert_eq!(a, Observation::new());
    assert!(!a.contains("cup"));
    assert!(a.get("plate").is_empty());
  }

  #[test]
  fn observation_uses_list_wire_shape() {
    let observation = Observation::new().with("cup", det(1.0, 0.5));
    let json = serde_json::to_value(&observation).unwrap();
    assert_eq!(json, serde_json::json!({ "cup": [[1.0, 0.0, 11.0, 10.0, 0.5, 0]] }));
    let back: Observation = serde_json::from_value(json).unwrap();
    assert_eq!(back, observation);
  }

  #[test]
  fn canonical_key_is_order_independent() {
    let a: ProcessorSpec =
      serde_json::from_str(r#"{"type": "DummyProcessor", "args": {"a": 1, "b": 2}}"#).unwrap();
    let b: ProcessorSpec =
      serde_json::from_str(r#"{"type": "DummyProcessor", "args": {"b": 2, "a": 1}}"#).unwrap();
    assert_eq!(a.canonical_key(), b.canonical_key());
  }
}
