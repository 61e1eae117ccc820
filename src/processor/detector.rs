// 该文件是 Zhiyin （指引） 项目的一部分。
// src/processor/detector.rs - 目标检测处理器
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

use std::{borrow::Cow, collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use tracing::{debug, info};

#[cfg(feature = "debug_draw")]
use crate::processor::DebugRecorder;
use crate::{
  frame::BgrFrame,
  processor::{Detection, Observation, Processor, ProcessorError, ProcessorKind, ProcessorSpec},
};

const DEFAULT_CONF_THRESHOLD: f64 = 0.8;
const DEFAULT_NMS_THRESHOLD: f64 = 0.3;

fn default_conf_threshold() -> f64 {
  DEFAULT_CONF_THRESHOLD
}

fn default_nms_threshold() -> f64 {
  DEFAULT_NMS_THRESHOLD
}

/// 阈值允许写成数字或数字字符串，且必须落在 [0, 1] 内
fn threshold<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Raw {
    Number(f64),
    Text(String),
  }

  let value = match Raw::deserialize(deserializer)? {
    Raw::Number(value) => value,
    Raw::Text(text) => text
      .trim()
      .parse::<f64>()
      .map_err(|_| D::Error::custom(format!("阈值无法解析为浮点数: {text:?}")))?,
  };

  if !(0.0..=1.0).contains(&value) {
    return Err(D::Error::custom(format!("阈值 {value} 超出 [0, 1] 范围")));
  }
  Ok(value)
}

/// 检测器的构造参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectorConfig {
  /// ONNX 模型文件
  pub model_path: PathBuf,
  /// 按类别编号索引的标签，不含背景类
  #[serde(default)]
  pub labels: Option<Vec<String>>,
  #[serde(default = "default_conf_threshold", deserialize_with = "threshold")]
  pub conf_threshold: f64,
  #[serde(default = "default_nms_threshold", deserialize_with = "threshold")]
  pub nms_threshold: f64,
}

impl DetectorConfig {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      labels: None,
      conf_threshold: DEFAULT_CONF_THRESHOLD,
      nms_threshold: DEFAULT_NMS_THRESHOLD,
    }
  }

  pub fn with_labels<S: Into<String>>(mut self, labels: impl IntoIterator<Item = S>) -> Self {
    self.labels = Some(labels.into_iter().map(Into::into).collect());
    self
  }

  pub fn with_conf_threshold(mut self, conf_threshold: f64) -> Self {
    self.conf_threshold = conf_threshold;
    self
  }

  /// 没有配置标签时用类别编号作为键
  pub fn label_of(&self, class_id: u32) -> String {
    self
      .labels
      .as_ref()
      .and_then(|labels| labels.get(class_id as usize))
      .cloned()
      .unwrap_or_else(|| class_id.to_string())
  }
}

/// 推理前的缩放策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalePolicy {
  /// 短边缩放到 `target`，长边不超过 `max_size`
  ShortSide { target: u32, max_size: u32 },
  /// 仅当长边超过 `max_size` 时缩小
  CapLongSide { max_size: u32 },
}

impl ScalePolicy {
  pub fn scale_for(&self, height: usize, width: usize) -> f32 {
    let short = height.min(width) as f32;
    let long = height.max(width) as f32;
    match *self {
      ScalePolicy::ShortSide { target, max_size } => {
        let scale = target as f32 / short;
        if (scale * long).round() > max_size as f32 {
          max_size as f32 / long
        } else {
          scale
        }
      }
      ScalePolicy::CapLongSide { max_size } => {
        if long > max_size as f32 {
          max_size as f32 / long
        } else {
          1.0
        }
      }
    }
  }
}

/// 推理引擎的原始输出，坐标位于缩放后的图像上
#[derive(Debug, Clone, PartialEq)]
pub enum RawDetections {
  /// DetectionOutput 层格式，每行为 `[image_id, label, conf, x1, y1, x2, y2]`，label 0 为背景
  Rows(Vec<[f32; 7]>),
  /// 每个候选框对每个类别的分数与回归框，第 0 列为背景
  PerClass {
    scores: Vec<Vec<f32>>,
    boxes: Vec<Vec<[f32; 4]>>,
  },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

impl RawDetections {
  /// 展开为候选列表，跳过背景类；类别编号从前景第一类起算
  pub fn into_items(self) -> Vec<DetectItem> {
    match self {
      RawDetections::Rows(rows) => rows
        .into_iter()
        .filter(|row| row[1] >= 1.0)
        .map(|row| DetectItem {
          class_id: row[1] as u32 - 1,
          score: row[2],
          bbox: [row[3], row[4], row[5], row[6]],
        })
        .collect(),
      RawDetections::PerClass { scores, boxes } => scores
        .iter()
        .zip(boxes.iter())
        .flat_map(|(scores, boxes)| {
          scores
            .iter()
            .zip(boxes.iter())
            .enumerate()
            .skip(1)
            .map(|(cls_idx, (&score, &bbox))| DetectItem {
              class_id: cls_idx as u32 - 1,
              score,
              bbox,
            })
        })
        .collect(),
    }
  }
}

/// 外部推理引擎
pub trait InferenceBackend {
  /// `scale` 为输入帧相对原图的缩放比例
  fn forward(&self, frame: &BgrFrame, scale: f32) -> Result<RawDetections, ProcessorError>;
}

pub fn filter_by_confidence(items: Vec<DetectItem>, conf_threshold: f64) -> Vec<DetectItem> {
  items
    .into_iter()
    .filter(|item| f64::from(item.score) >= conf_threshold)
    .collect()
}

/// 计算两个边界框的 IoU
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}

/// 按类别做非极大值抑制，返回保留项在原列表中的下标，顺序不做保证
pub fn nms(items: &[DetectItem], iou_threshold: f64) -> Vec<usize> {
  let mut by_class: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
  for (idx, item) in items.iter().enumerate() {
    by_class.entry(item.class_id).or_default().push(idx);
  }

  let mut keep = Vec::new();
  for (_, mut candidates) in by_class {
    // 按置信度降序排序
    candidates.sort_by(|&a, &b| items[b].score.total_cmp(&items[a].score));

    let mut kept_in_class: Vec<usize> = Vec::new();
    for idx in candidates {
      let suppressed = kept_in_class
        .iter()
        .any(|&k| f64::from(iou(&items[k].bbox, &items[idx].bbox)) > iou_threshold);
      if !suppressed {
        kept_in_class.push(idx);
      }
    }
    keep.extend(kept_in_class);
  }
  keep
}

/// 由推理引擎支撑的检测处理器
pub struct Detector<B> {
  kind: ProcessorKind,
  config: DetectorConfig,
  spec: ProcessorSpec,
  policy: ScalePolicy,
  backend: B,
  #[cfg(feature = "debug_draw")]
  recorder: Option<DebugRecorder>,
}

impl<B: InferenceBackend> Detector<B> {
  pub fn new(kind: ProcessorKind, config: DetectorConfig, backend: B) -> Result<Self, ProcessorError> {
    let spec = ProcessorSpec::encode(kind.type_name(), &config)?;
    let policy = kind
      .scale_policy()
      .ok_or_else(|| ProcessorError::invalid_spec(kind.type_name(), "该类型不是检测器"))?;
    info!(
      "创建 {}: 模型 {}, 标签 {:?}, 置信度阈值 {}, NMS 阈值 {}",
      kind.type_name(),
      config.model_path.display(),
      config.labels,
      config.conf_threshold,
      config.nms_threshold
    );

    Ok(Self {
      kind,
      config,
      spec,
      policy,
      backend,
      #[cfg(feature = "debug_draw")]
      recorder: None,
    })
  }

  #[cfg(feature = "debug_draw")]
  pub fn with_recorder(mut self, recorder: DebugRecorder) -> Self {
    self.recorder = Some(recorder);
    self
  }

  pub fn kind(&self) -> ProcessorKind {
    self.kind
  }

  pub fn config(&self) -> &DetectorConfig {
    &self.config
  }

  fn postprocess(&self, raw: RawDetections, scale: f32) -> Observation {
    let items = filter_by_confidence(raw.into_items(), self.config.conf_threshold);
    let keep = nms(&items, self.config.nms_threshold);

    let mut observation = Observation::new();
    for idx in keep {
      let item = &items[idx];
      observation.push(
        self.config.label_of(item.class_id),
        Detection {
          left: item.bbox[0] / scale,
          top: item.bbox[1] / scale,
          right: item.bbox[2] / scale,
          bottom: item.bbox[3] / scale,
          confidence: item.score,
          class_id: item.class_id,
        },
      );
    }
    observation
  }
}

impl<B: InferenceBackend> Processor for Detector<B> {
  fn infer(&self, frame: &BgrFrame) -> Result<Observation, ProcessorError> {
    frame.ensure_bgr()?;

    let scale = self.policy.scale_for(frame.height(), frame.width());
    let input = if (scale - 1.0).abs() > f32::EPSILON {
      Cow::Owned(frame.resize(scale)?)
    } else {
      Cow::Borrowed(frame)
    };
    debug!(
      "{} 输入 {}x{} 缩放至 {}x{} (比例 {:.4})",
      self.kind.type_name(),
      frame.width(),
      frame.height(),
      input.width(),
      input.height(),
      scale
    );

    let raw = self.backend.forward(&input, scale)?;
    let observation = self.postprocess(raw, scale);
    debug!("检测结果: {:?}", observation);

    #[cfg(feature = "debug_draw")]
    if let Some(recorder) = &self.recorder {
      recorder.record(frame, &observation);
    }

    Ok(observation)
  }

  fn spec(&self) -> ProcessorSpec {
    self.spec.clone()
  }
}
