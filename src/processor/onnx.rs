// 该文件是 Zhiyin （指引） 项目的一部分。
// src/processor/onnx.rs - ONNX 推理后端
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

use std::path::Path;

use tracing::{debug, error, info};
use tract_onnx::prelude::*;

use crate::{
  frame::BgrFrame,
  processor::{InferenceBackend, ProcessorError, RawDetections},
};

// 与 Faster R-CNN 训练时一致的像素均值（BGR 顺序）
const PIXEL_MEANS: [f32; 3] = [102.9801, 115.9465, 122.7717];
const DETECTION_ROW_LEN: usize = 7;
const DATA_INPUT: &str = "data";
const IM_INFO_INPUT: &str = "im_info";

/// 两个输入时按名字确定 `im_info` 的位置，名字都不匹配时视为第二个输入
fn im_info_position(names: &[&str]) -> Option<usize> {
  if names.len() != 2 {
    return None;
  }
  names
    .iter()
    .position(|name| *name == IM_INFO_INPUT)
    .or_else(|| {
      names
        .iter()
        .position(|name| *name == DATA_INPUT)
        .map(|data| 1 - data)
    })
    .or(Some(1))
}

/// 模型输出的排列方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
  /// 单个 DetectionOutput 输出，形如 `[1, 1, N, 7]`
  DetectionRows,
  /// 两个输出：分数 `[N, C + 1]` 与回归框 `[N, 4 * (C + 1)]`
  ClassScores,
}

pub struct OnnxBackend {
  plan: TypedRunnableModel<TypedModel>,
  layout: OutputLayout,
  /// `im_info` 在模型输入中的位置，单输入模型为 `None`
  im_info_slot: Option<usize>,
}

impl OnnxBackend {
  pub fn load(model_path: &Path, layout: OutputLayout) -> Result<Self, ProcessorError> {
    info!("加载模型文件: {}", model_path.display());
    let model = tract_onnx::onnx()
      .model_for_path(model_path)
      .map_err(|e| ProcessorError::model_load(model_path, e))?;

    let num_inputs = model.inputs.len();
    debug!("模型输入数量: {}", num_inputs);
    if !(1..=2).contains(&num_inputs) {
      error!("预期模型输入数量为 1 或 2, 实际为 {}", num_inputs);
      return Err(ProcessorError::model_load(
        model_path,
        format!("预期模型输入数量为 1 或 2, 实际为 {num_inputs}"),
      ));
    }

    let names = model
      .inputs
      .iter()
      .map(|outlet| model.node(outlet.node).name.as_str())
      .collect::<Vec<_>>();
    let im_info_slot = im_info_position(&names);
    debug!("模型输入: {:?}, im_info 位置: {:?}", names, im_info_slot);

    let plan = model
      .into_optimized()
      .and_then(|model| model.into_runnable())
      .map_err(|e| ProcessorError::model_load(model_path, e))?;
    info!("模型加载完成");

    Ok(Self {
      plan,
      layout,
      im_info_slot,
    })
  }

  fn blob(frame: &BgrFrame) -> Tensor {
    let (height, width) = (frame.height(), frame.width());
    tract_ndarray::Array4::<f32>::from_shape_fn((1, 3, height, width), |(_, c, y, x)| {
      f32::from(frame.pixel(y, x)[c]) - PIXEL_MEANS[c]
    })
    .into_tensor()
  }

  fn decode(&self, outputs: TVec<TValue>) -> Result<RawDetections, ProcessorError> {
    let tensor = |idx: usize| -> Result<Vec<f32>, ProcessorError> {
      let value = outputs
        .get(idx)
        .ok_or_else(|| ProcessorError::Inference(format!("缺少第 {idx} 个输出")))?;
      let view = value
        .to_array_view::<f32>()
        .map_err(|e| ProcessorError::Inference(e.to_string()))?;
      Ok(view.iter().copied().collect())
    };

    match self.layout {
      OutputLayout::DetectionRows => {
        let data = tensor(0)?;
        if data.len() % DETECTION_ROW_LEN != 0 {
          return Err(ProcessorError::Inference(format!(
            "DetectionOutput 长度 {} 不是 {} 的整数倍",
            data.len(),
            DETECTION_ROW_LEN
          )));
        }
        let rows = data
          .chunks_exact(DETECTION_ROW_LEN)
          .map(|row| {
            let mut out = [0.0f32; DETECTION_ROW_LEN];
            out.copy_from_slice(row);
            out
          })
          .collect();
        Ok(RawDetections::Rows(rows))
      }
      OutputLayout::ClassScores => {
        let num_proposals = outputs
          .first()
          .map(|value| value.shape().first().copied().unwrap_or(0))
          .unwrap_or(0);
        let scores = tensor(0)?;
        let boxes = tensor(1)?;
        if num_proposals == 0 || scores.is_empty() {
          return Ok(RawDetections::PerClass {
            scores: Vec::new(),
            boxes: Vec::new(),
          });
        }

        let num_classes = scores.len() / num_proposals;
        if scores.len() != num_proposals * num_classes || boxes.len() != scores.len() * 4 {
          error!(
            "输出大小不匹配 - 分数: {}, 回归: {}, 候选框: {}",
            scores.len(),
            boxes.len(),
            num_proposals
          );
          return Err(ProcessorError::Inference(format!(
            "输出大小不匹配: 分数 {}, 回归 {}",
            scores.len(),
            boxes.len()
          )));
        }

        let scores = scores.chunks_exact(num_classes).map(<[f32]>::to_vec).collect();
        let boxes = boxes
          .chunks_exact(num_classes * 4)
          .map(|row| {
            row
              .chunks_exact(4)
              .map(|b| [b[0], b[1], b[2], b[3]])
              .collect()
          })
          .collect();
        Ok(RawDetections::PerClass { scores, boxes })
      }
    }
  }
}

impl InferenceBackend for OnnxBackend {
  fn forward(&self, frame: &BgrFrame, scale: f32) -> Result<RawDetections, ProcessorError> {
    let blob: TValue = Self::blob(frame).into();
    let inputs: TVec<TValue> = match self.im_info_slot {
      None => tvec!(blob),
      Some(slot) => {
        let im_info: TValue =
          tract_ndarray::arr2(&[[frame.height() as f32, frame.width() as f32, scale]])
            .into_tensor()
            .into();
        if slot == 0 {
          tvec!(im_info, blob)
        } else {
          tvec!(blob, im_info)
        }
      }
    };

    debug!("执行模型推理");
    let now = std::time::Instant::now();
    let outputs = self
      .plan
      .run(inputs)
      .map_err(|e| ProcessorError::Inference(e.to_string()))?;
    debug!("推理完成，耗时: {:.2?}", now.elapsed());

    self.decode(outputs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_model_is_model_load_error() {
    let path = Path::new("/nonexistent/zhiyin/model.onnx");
    match OnnxBackend::load(path, OutputLayout::DetectionRows) {
      Err(ProcessorError::ModelLoad { path: p, .. }) => assert_eq!(p, path),
      Err(other) => panic!("unexpected error: {other}"),
      Ok(_) => panic!("loading a missing model must fail"),
    }
  }

  #[test]
  fn blob_subtracts_pixel_means() {
    let frame = BgrFrame::filled(2, 2, [103, 116, 123]);
    let blob = OnnxBackend::blob(&frame);
    assert_eq!(blob.shape(), &[1, 3, 2, 2]);
    let view = blob.to_array_view::<f32>().unwrap();
    assert!((view[&[0, 0, 0, 0][..]] - (103.0 - 102.9801)).abs() < 1e-4);
    assert!((view[&[0, 2, 1, 1][..]] - (123.0 - 122.7717)).abs() < 1e-4);
  }

  #[test]
  fn im_info_is_located_by_name() {
    assert_eq!(im_info_position(&["data"]), None);
    assert_eq!(im_info_position(&["data", "im_info"]), Some(1));
    assert_eq!(im_info_position(&["im_info", "data"]), Some(0));
    assert_eq!(im_info_position(&["info", "data"]), Some(0));
    assert_eq!(im_info_position(&["input_0", "input_1"]), Some(1));
  }
}
