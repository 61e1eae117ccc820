// 该文件是 Zhiyin （指引） 项目的一部分。
// src/output.rs - 输出定义
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

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::BgrFrame};

/// 输出端：接收状态机发出的指引
pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

/// 一次转移发出的指引，`payload` 原样来自定义文件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Guidance {
  pub frame_index: u64,
  pub from_state: String,
  pub to_state: String,
  pub payload: Value,
}

mod log_output;
pub use self::log_output::LogOutput;

mod json_lines;
pub use self::json_lines::{JsonLinesError, JsonLinesOutput, StdoutOutput};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("JSON Lines 输出错误: {0}")]
  JsonLinesError(#[from] JsonLinesError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum OutputWrapper {
  LogOutput(LogOutput),
  JsonLinesOutput(JsonLinesOutput),
  StdoutOutput(StdoutOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      LogOutput::SCHEME => Ok(OutputWrapper::LogOutput(LogOutput::default())),
      JsonLinesOutput::SCHEME => {
        let output = JsonLinesOutput::from_url(url)?;
        Ok(OutputWrapper::JsonLinesOutput(output))
      }
      StdoutOutput::SCHEME => Ok(OutputWrapper::StdoutOutput(StdoutOutput::default())),
      other => Err(OutputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl Render<BgrFrame, Guidance> for OutputWrapper {
  type Error = OutputError;

  fn render_result(&self, frame: &BgrFrame, result: &Guidance) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::LogOutput(output) => match output.render_result(frame, result) {
        Ok(()) => Ok(()),
        Err(never) => match never {},
      },
      OutputWrapper::JsonLinesOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
      OutputWrapper::StdoutOutput(output) => output
        .render_result(frame, result)
        .map_err(OutputError::from),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dispatches_on_scheme() {
    let log = OutputWrapper::from_url(&Url::parse("log:").unwrap()).unwrap();
    assert!(matches!(log, OutputWrapper::LogOutput(_)));
    let stdout = OutputWrapper::from_url(&Url::parse("stdout:").unwrap()).unwrap();
    assert!(matches!(stdout, OutputWrapper::StdoutOutput(_)));
    assert!(matches!(
      OutputWrapper::from_url(&Url::parse("rtsp://camera/stream").unwrap()),
      Err(OutputError::SchemeMismatch(scheme)) if scheme == "rtsp"
    ));
  }
}
