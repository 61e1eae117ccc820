// 该文件是 Zhiyin （指引） 项目的一部分。
// src/processor/registry.rs - 处理器注册与构建
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

use std::{fmt, path::PathBuf, str::FromStr};

use tracing::{debug, warn};

#[cfg(feature = "onnx")]
use crate::processor::{Detector, DetectorConfig, OnnxBackend, OutputLayout};
use crate::processor::{
  DummyProcessor, Processor, ProcessorError, ProcessorSpec, ProcessorWrapper, ScalePolicy,
};

/// 已注册的处理器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorKind {
  Dummy,
  FasterRcnnOpenCv,
  FasterRcnn,
}

impl ProcessorKind {
  pub const ALL: [ProcessorKind; 3] = [
    ProcessorKind::Dummy,
    ProcessorKind::FasterRcnnOpenCv,
    ProcessorKind::FasterRcnn,
  ];

  /// 定义文件中使用的类型名
  pub const fn type_name(self) -> &'static str {
    match self {
      ProcessorKind::Dummy => "DummyProcessor",
      ProcessorKind::FasterRcnnOpenCv => "FasterRCNNOpenCVProcessor",
      ProcessorKind::FasterRcnn => "FasterRCNNProcessor",
    }
  }

  pub const fn scale_policy(self) -> Option<ScalePolicy> {
    match self {
      ProcessorKind::Dummy => None,
      ProcessorKind::FasterRcnnOpenCv => Some(ScalePolicy::ShortSide {
        target: 600,
        max_size: 1000,
      }),
      ProcessorKind::FasterRcnn => Some(ScalePolicy::CapLongSide { max_size: 640 }),
    }
  }
}

impl fmt::Display for ProcessorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.type_name())
  }
}

impl FromStr for ProcessorKind {
  type Err = ProcessorError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    ProcessorKind::ALL
      .into_iter()
      .find(|kind| kind.type_name() == s)
      .ok_or_else(|| ProcessorError::UnknownProcessorType(s.to_string()))
  }
}

/// 由描述构建处理器
pub trait BuildProcessor {
  type Processor: Processor;
  fn build(&self, spec: &ProcessorSpec) -> Result<Self::Processor, ProcessorError>;
}

/// 取回处理器构造时记录的描述
pub fn serialize<P: Processor + ?Sized>(processor: &P) -> ProcessorSpec {
  processor.spec()
}

/// 处理器注册表，附带与描述无关的进程级设置
#[derive(Debug, Clone, Default)]
pub struct Registry {
  debug_dir: Option<PathBuf>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_debug_dir(mut self, debug_dir: Option<PathBuf>) -> Self {
    if debug_dir.is_some() && cfg!(not(feature = "debug_draw")) {
      warn!("未启用 debug_draw 特性，忽略调试输出目录");
    }
    self.debug_dir = debug_dir;
    self
  }

  pub fn build(&self, spec: &ProcessorSpec) -> Result<ProcessorWrapper, ProcessorError> {
    let kind: ProcessorKind = spec.kind.parse()?;
    debug!("构建处理器 {}: {:?}", kind, spec.args);
    match kind {
      ProcessorKind::Dummy => DummyProcessor::from_spec(spec).map(ProcessorWrapper::Dummy),
      ProcessorKind::FasterRcnnOpenCv | ProcessorKind::FasterRcnn => self.build_detector(kind, spec),
    }
  }

  pub fn serialize(&self, processor: &ProcessorWrapper) -> ProcessorSpec {
    serialize(processor)
  }

  #[cfg(feature = "onnx")]
  fn build_detector(
    &self,
    kind: ProcessorKind,
    spec: &ProcessorSpec,
  ) -> Result<ProcessorWrapper, ProcessorError> {
    let config: DetectorConfig = spec.decode_args()?;
    let layout = match kind {
      ProcessorKind::FasterRcnnOpenCv => OutputLayout::DetectionRows,
      _ => OutputLayout::ClassScores,
    };
    let backend = OnnxBackend::load(&config.model_path, layout)?;
    let detector = Detector::new(kind, config, backend)?;

    #[cfg(feature = "debug_draw")]
    let detector = match &self.debug_dir {
      Some(dir) => detector.with_recorder(crate::processor::DebugRecorder::new(dir)),
      None => detector,
    };

    Ok(ProcessorWrapper::Detector(detector))
  }

  #[cfg(not(feature = "onnx"))]
  fn build_detector(
    &self,
    kind: ProcessorKind,
    _spec: &ProcessorSpec,
  ) -> Result<ProcessorWrapper, ProcessorError> {
    Err(ProcessorError::Unsupported(kind.type_name().to_string()))
  }
}

impl BuildProcessor for Registry {
  type Processor = ProcessorWrapper;

  fn build(&self, spec: &ProcessorSpec) -> Result<Self::Processor, ProcessorError> {
    Registry::build(self, spec)
  }
}
