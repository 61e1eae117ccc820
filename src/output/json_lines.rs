// 该文件是 Zhiyin （指引） 项目的一部分。
// src/output/json_lines.rs - JSON Lines 输出
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

use std::{
  fs::{File, OpenOptions},
  io::{LineWriter, Write},
  path::Path,
  sync::Mutex,
};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::BgrFrame,
  output::{Guidance, Render},
};

#[derive(Error, Debug)]
pub enum JsonLinesError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  SerdeError(#[from] serde_json::Error),
  #[error("输出已被并发写入破坏")]
  Poisoned,
}

#[derive(Serialize)]
struct Record<'a> {
  timestamp: String,
  frame_index: u64,
  from_state: &'a str,
  to_state: &'a str,
  payload: &'a Value,
}

impl<'a> From<&'a Guidance> for Record<'a> {
  fn from(guidance: &'a Guidance) -> Self {
    Record {
      timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
      frame_index: guidance.frame_index,
      from_state: &guidance.from_state,
      to_state: &guidance.to_state,
      payload: &guidance.payload,
    }
  }
}

fn write_record<W: Write>(writer: &mut W, guidance: &Guidance) -> Result<(), JsonLinesError> {
  serde_json::to_writer(&mut *writer, &Record::from(guidance))?;
  writer.write_all(b"\n")?;
  Ok(())
}

/// 每条指引追加一行 JSON 到文件
pub struct JsonLinesOutput {
  writer: Mutex<LineWriter<File>>,
}

impl FromUrlWithScheme for JsonLinesOutput {
  const SCHEME: &'static str = "jsonl";
}

impl FromUrl for JsonLinesOutput {
  type Error = JsonLinesError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(JsonLinesError::SchemeMismatch);
    }
    Self::create(url.path())
  }
}

impl JsonLinesOutput {
  pub fn create(path: impl AsRef<Path>) -> Result<Self, JsonLinesError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    info!("指引输出到文件: {}", path.display());
    Ok(Self {
      writer: Mutex::new(LineWriter::new(file)),
    })
  }
}

impl Render<BgrFrame, Guidance> for JsonLinesOutput {
  type Error = JsonLinesError;

  fn render_result(&self, _frame: &BgrFrame, result: &Guidance) -> Result<(), Self::Error> {
    let mut writer = self.writer.lock().map_err(|_| JsonLinesError::Poisoned)?;
    write_record(&mut *writer, result)
  }
}

/// 每条指引输出一行 JSON 到标准输出
#[derive(Debug, Default)]
pub struct StdoutOutput;

impl FromUrlWithScheme for StdoutOutput {
  const SCHEME: &'static str = "stdout";
}

impl FromUrl for StdoutOutput {
  type Error = JsonLinesError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(JsonLinesError::SchemeMismatch);
    }
    Ok(StdoutOutput)
  }
}

impl Render<BgrFrame, Guidance> for StdoutOutput {
  type Error = JsonLinesError;

  fn render_result(&self, _frame: &BgrFrame, result: &Guidance) -> Result<(), Self::Error> {
    let mut stdout = std::io::stdout().lock();
    write_record(&mut stdout, result)?;
    stdout.flush()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn appends_one_line_per_guidance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("out").join("guidance.jsonl");
    let url = Url::from_file_path(&path).unwrap();
    let url = Url::parse(&url.as_str().replacen("file:", "jsonl:", 1)).unwrap();

    let output = JsonLinesOutput::from_url(&url).unwrap();
    let frame = BgrFrame::with_shape(1, 1);
    for (i, audio) in ["first", "second"].into_iter().enumerate() {
      let guidance = Guidance {
        frame_index: i as u64,
        from_state: "a".into(),
        to_state: "b".into(),
        payload: json!({ "audio": audio }),
      };
      output.render_result(&frame, &guidance).unwrap();
    }
    drop(output);

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<Value> = content
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1]["frame_index"], json!(1));
    assert_eq!(lines[1]["payload"], json!({ "audio": "second" }));
    assert_eq!(lines[0]["to_state"], json!("b"));
  }

  #[test]
  fn rejects_other_scheme() {
    let url = Url::parse("file:///tmp/out.jsonl").unwrap();
    assert!(matches!(
      JsonLinesOutput::from_url(&url),
      Err(JsonLinesError::SchemeMismatch)
    ));
  }
}
