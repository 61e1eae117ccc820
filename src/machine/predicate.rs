// 该文件是 Zhiyin （指引） 项目的一部分。
// src/machine/predicate.rs - 转移谓词
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

use crate::processor::{Detection, Observation};

/// 观测上的布尔条件，求值不产生副作用
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
  #[default]
  Always,
  /// 至少有一个该类别的检测，且置信度不低于 `min_confidence`
  HasClass {
    class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_confidence: Option<f64>,
  },
  /// 没有该类别的检测
  LacksClass { class: String },
  /// 该类别满足置信度要求的检测不少于 `count` 个
  MinCount {
    class: String,
    count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_confidence: Option<f64>,
  },
  All { of: Vec<Predicate> },
  Any { of: Vec<Predicate> },
  Not { predicate: Box<Predicate> },
}

fn confident<'a>(
  observation: &'a Observation,
  class: &str,
  min_confidence: Option<f64>,
) -> impl Iterator<Item = &'a Detection> {
  let threshold = min_confidence.unwrap_or(f64::NEG_INFINITY);
  observation
    .get(class)
    .iter()
    .filter(move |d| f64::from(d.confidence) >= threshold)
}

impl Predicate {
  pub fn has_class(class: impl Into<String>) -> Self {
    Predicate::HasClass {
      class: class.into(),
      min_confidence: None,
    }
  }

  pub fn lacks_class(class: impl Into<String>) -> Self {
    Predicate::LacksClass {
      class: class.into(),
    }
  }

  pub fn evaluate(&self, observation: &Observation) -> bool {
    match self {
      Predicate::Always => true,
      Predicate::HasClass {
        class,
        min_confidence,
      } => confident(observation, class, *min_confidence)
        .next()
        .is_some(),
      Predicate::LacksClass { class } => !observation.contains(class),
      Predicate::MinCount {
        class,
        count,
        min_confidence,
      } => confident(observation, class, *min_confidence).count() >= *count,
      Predicate::All { of } => of.iter().all(|p| p.evaluate(observation)),
      Predicate::Any { of } => of.iter().any(|p| p.evaluate(observation)),
      Predicate::Not { predicate } => !predicate.evaluate(observation),
    }
  }

  /// 检查参数是否合法，返回问题描述
  pub fn validate(&self) -> Result<(), String> {
    let check_confidence = |value: &Option<f64>| match value {
      Some(v) if !(0.0..=1.0).contains(v) => Err(format!("置信度 {v} 超出 [0, 1] 范围")),
      _ => Ok(()),
    };

    match self {
      Predicate::Always => Ok(()),
      Predicate::HasClass {
        class,
        min_confidence,
      }
      | Predicate::MinCount {
        class,
        min_confidence,
        ..
      } => {
        if class.is_empty() {
          return Err("类别名不能为空".to_string());
        }
        check_confidence(min_confidence)
      }
      Predicate::LacksClass { class } if class.is_empty() => Err("类别名不能为空".to_string()),
      Predicate::LacksClass { .. } => Ok(()),
      Predicate::All { of } | Predicate::Any { of } => {
        if of.is_empty() {
          return Err("组合谓词至少需要一个子谓词".to_string());
        }
        of.iter().try_for_each(Predicate::validate)
      }
      Predicate::Not { predicate } => predicate.validate(),
    }
  }
}
