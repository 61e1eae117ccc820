// 该文件是 Zhiyin （指引） 项目的一部分。
// src/processor/dummy.rs - 固定输出的处理器
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

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
  frame::BgrFrame,
  processor::{Observation, Processor, ProcessorError, ProcessorKind, ProcessorSpec},
};

fn default_dummy_input() -> String {
  "dummy_input_value".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DummyConfig {
  #[serde(default = "default_dummy_input")]
  pub dummy_input: String,
  /// 每一帧都原样返回的观测
  #[serde(default)]
  pub observation: Observation,
}

impl Default for DummyConfig {
  fn default() -> Self {
    Self {
      dummy_input: default_dummy_input(),
      observation: Observation::default(),
    }
  }
}

/// 不做推理的处理器，用于测试与流程联调
#[derive(Debug, Clone)]
pub struct DummyProcessor {
  config: DummyConfig,
  spec: ProcessorSpec,
}

impl DummyProcessor {
  pub fn new(config: DummyConfig) -> Result<Self, ProcessorError> {
    let kind = ProcessorKind::Dummy.type_name();
    for (class_name, detections) in config.observation.iter() {
      if let Some(d) = detections
        .iter()
        .find(|d| !(0.0..=1.0).contains(&d.confidence))
      {
        return Err(ProcessorError::invalid_spec(
          kind,
          format!("类别 {class_name} 的置信度 {} 超出 [0, 1] 范围", d.confidence),
        ));
      }
    }

    let spec = ProcessorSpec::encode(kind, &config)?;
    debug!("创建 DummyProcessor: {:?}", config);
    Ok(Self { config, spec })
  }

  pub fn from_spec(spec: &ProcessorSpec) -> Result<Self, ProcessorError> {
    Self::new(spec.decode_args()?)
  }

  pub fn to_spec(&self) -> ProcessorSpec {
    self.spec.clone()
  }

  pub fn config(&self) -> &DummyConfig {
    &self.config
  }
}

impl Processor for DummyProcessor {
  fn infer(&self, frame: &BgrFrame) -> Result<Observation, ProcessorError> {
    frame.ensure_bgr()?;
    Ok(self.config.observation.clone())
  }

  fn spec(&self) -> ProcessorSpec {
    self.to_spec()
  }
}
