// 该文件是 Zhiyin （指引） 项目的一部分。
// src/machine/definition.rs - 状态机定义文件
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
  collections::HashSet,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::{
  machine::Predicate,
  processor::{ProcessorError, ProcessorSpec},
};

#[derive(Error, Debug)]
pub enum DefinitionError {
  #[error("读取状态机定义失败: {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("状态机定义格式错误: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("状态机定义中没有任何状态")]
  Empty,
  #[error("状态 {0:?} 重复定义")]
  DuplicateState(String),
  #[error("状态名不能为空")]
  EmptyStateName,
  #[error("初始状态 {0:?} 不存在")]
  UnknownInitialState(String),
  #[error("状态 {state:?} 的第 {index} 条转移指向不存在的状态 {target:?}")]
  DanglingTransition {
    state: String,
    index: usize,
    target: String,
  },
  #[error("状态 {state:?} 的第 {index} 条转移谓词无效: {reason}")]
  InvalidPredicate {
    state: String,
    index: usize,
    reason: String,
  },
  #[error("状态 {state:?} 的处理器构建失败: {source}")]
  Processor {
    state: String,
    #[source]
    source: ProcessorError,
  },
}

/// 状态机定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineDefinition {
  pub initial_state: String,
  pub states: Vec<StateDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateDefinition {
  pub name: String,
  pub processor: ProcessorSpec,
  #[serde(default)]
  pub transitions: Vec<TransitionDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionDefinition {
  /// 省略时总是成立
  #[serde(default)]
  pub when: Predicate,
  pub next_state: String,
  /// 转移时原样交给输出端的内容
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output: Option<Value>,
}

impl MachineDefinition {
  pub fn from_json_str(json: &str) -> Result<Self, DefinitionError> {
    let definition: MachineDefinition = serde_json::from_str(json)?;
    definition.validate()?;
    Ok(definition)
  }

  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
    let path = path.as_ref();
    info!("加载状态机定义: {}", path.display());
    let json = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json_str(&json)
  }

  pub fn to_json_pretty(&self) -> Result<String, DefinitionError> {
    Ok(serde_json::to_string_pretty(self)?)
  }

  pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DefinitionError> {
    let path = path.as_ref();
    std::fs::write(path, self.to_json_pretty()?).map_err(|source| DefinitionError::Io {
      path: path.to_path_buf(),
      source,
    })
  }

  /// 结构校验，不构建处理器
  pub fn validate(&self) -> Result<(), DefinitionError> {
    if self.states.is_empty() {
      return Err(DefinitionError::Empty);
    }

    let mut names = HashSet::new();
    for state in &self.states {
      if state.name.is_empty() {
        return Err(DefinitionError::EmptyStateName);
      }
      if !names.insert(state.name.as_str()) {
        return Err(DefinitionError::DuplicateState(state.name.clone()));
      }
    }

    if !names.contains(self.initial_state.as_str()) {
      return Err(DefinitionError::UnknownInitialState(
        self.initial_state.clone(),
      ));
    }

    for state in &self.states {
      for (index, transition) in state.transitions.iter().enumerate() {
        if !names.contains(transition.next_state.as_str()) {
          return Err(DefinitionError::DanglingTransition {
            state: state.name.clone(),
            index,
            target: transition.next_state.clone(),
          });
        }
        transition
          .when
          .validate()
          .map_err(|reason| DefinitionError::InvalidPredicate {
            state: state.name.clone(),
            index,
            reason,
          })?;
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const TWO_STATES: &str = r#"{
    "initial_state": "start",
    "states": [
      {
        "name": "start",
        "processor": { "type": "DummyProcessor", "args": {} },
        "transitions": [
          { "when": { "type": "has_class", "class": "cup" }, "next_state": "done", "output": { "audio": "cup found" } }
        ]
      },
      {
        "name": "done",
        "processor": { "type": "DummyProcessor" }
      }
    ]
  }"#;

  #[test]
  fn parses_valid_definition() {
    let definition = MachineDefinition::from_json_str(TWO_STATES).unwrap();
    assert_eq!(definition.initial_state, "start");
    assert_eq!(definition.states.len(), 2);
    assert!(definition.states[1].transitions.is_empty());
    assert_eq!(
      definition.states[0].transitions[0].output,
      Some(serde_json::json!({ "audio": "cup found" }))
    );
  }

  #[test]
  fn omitted_predicate_defaults_to_always() {
    let json = r#"{
      "initial_state": "a",
      "states": [
        { "name": "a", "processor": { "type": "DummyProcessor" }, "transitions": [ { "next_state": "a" } ] }
      ]
    }"#;
    let definition = MachineDefinition::from_json_str(json).unwrap();
    assert_eq!(definition.states[0].transitions[0].when, Predicate::Always);
  }

  #[test]
  fn dangling_transition_names_state_and_target() {
    let json = TWO_STATES.replace(r#""next_state": "done""#, r#""next_state": "nowhere""#);
    match MachineDefinition::from_json_str(&json) {
      Err(DefinitionError::DanglingTransition {
        state,
        index,
        target,
      }) => {
        assert_eq!(state, "start");
        assert_eq!(index, 0);
        assert_eq!(target, "nowhere");
      }
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[test]
  fn unknown_initial_state_is_rejected() {
    let json = TWO_STATES.replace(r#""initial_state": "start""#, r#""initial_state": "begin""#);
    assert!(matches!(
      MachineDefinition::from_json_str(&json),
      Err(DefinitionError::UnknownInitialState(name)) if name == "begin"
    ));
  }

  #[test]
  fn duplicate_state_is_rejected() {
    let json = TWO_STATES.replace(r#""name": "done""#, r#""name": "start""#);
    assert!(matches!(
      MachineDefinition::from_json_str(&json),
      Err(DefinitionError::DuplicateState(name)) if name == "start"
    ));
  }

  #[test]
  fn malformed_json_is_parse_error() {
    assert!(matches!(
      MachineDefinition::from_json_str("{ \"states\": 3 }"),
      Err(DefinitionError::Parse(_))
    ));
    assert!(matches!(
      MachineDefinition::from_json_str(r#"{ "initial_state": "a", "states": [] }"#),
      Err(DefinitionError::Empty)
    ));
  }

  #[test]
  fn save_and_reload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("machine.json");
    let definition = MachineDefinition::from_json_str(TWO_STATES).unwrap();
    definition.save(&path).unwrap();
    assert_eq!(MachineDefinition::from_path(&path).unwrap(), definition);
  }

  #[test]
  fn missing_file_is_io_error() {
    assert!(matches!(
      MachineDefinition::from_path("/nonexistent/zhiyin/machine.json"),
      Err(DefinitionError::Io { .. })
    ));
  }
}
