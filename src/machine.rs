// 该文件是 Zhiyin （指引） 项目的一部分。
// src/machine.rs - 状态机引擎
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
  collections::HashMap,
  sync::{Arc, Mutex},
};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  frame::{BgrFrame, FrameError},
  processor::{BuildProcessor, Observation, Processor, ProcessorError, ProcessorSpec},
};

mod definition;
pub use self::definition::{
  DefinitionError, MachineDefinition, StateDefinition, TransitionDefinition,
};

mod predicate;
pub use self::predicate::Predicate;

#[derive(Error, Debug)]
pub enum StepError {
  #[error("状态 {state:?} 收到无效输入帧: {source}")]
  InvalidInput {
    state: String,
    #[source]
    source: FrameError,
  },
  #[error("状态 {state:?} 的处理器不可用")]
  ProcessorUnavailable { state: String },
  #[error("状态 {state:?} 推理失败: {source}")]
  Processor {
    state: String,
    #[source]
    source: ProcessorError,
  },
}

/// 单步结果
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
  /// 命中转移携带的输出
  pub output: Option<Value>,
  pub transitioned: bool,
  /// 本帧的观测
  pub observation: Observation,
}

struct ProcessorSlot<P> {
  spec: ProcessorSpec,
  processor: Mutex<P>,
}

struct Transition {
  when: Predicate,
  target: usize,
  output: Option<Value>,
}

struct State {
  name: String,
  slot: usize,
  transitions: Vec<Transition>,
}

/// 状态机：每一帧运行当前状态的处理器，按声明顺序取第一条成立的转移
///
/// 处理器在构建时一次性创建，描述相同的状态共用同一个实例；
/// 每个实例由互斥锁保护，同一时刻至多一次推理。
pub struct StateMachine<P> {
  slots: Vec<ProcessorSlot<P>>,
  states: Vec<State>,
  index: HashMap<String, usize>,
  initial: usize,
  current: usize,
}

/// 多个来源并发驱动时使用，整次 `step` 在锁内完成
pub type SharedStateMachine<P> = Arc<Mutex<StateMachine<P>>>;

impl<P: Processor> StateMachine<P> {
  /// 校验定义并构建全部处理器，任一失败则整体失败
  pub fn from_definition<F>(definition: &MachineDefinition, factory: &F) -> Result<Self, DefinitionError>
  where
    F: BuildProcessor<Processor = P>,
  {
    definition.validate()?;

    let index: HashMap<String, usize> = definition
      .states
      .iter()
      .enumerate()
      .map(|(idx, state)| (state.name.clone(), idx))
      .collect();

    let mut slots: Vec<ProcessorSlot<P>> = Vec::new();
    let mut slot_by_spec: HashMap<String, usize> = HashMap::new();
    let mut states = Vec::with_capacity(definition.states.len());

    for state in &definition.states {
      let key = state.processor.canonical_key();
      let slot = match slot_by_spec.get(&key) {
        Some(&slot) => {
          debug!("状态 {} 复用已构建的处理器 {}", state.name, state.processor.kind);
          slot
        }
        None => {
          let processor =
            factory
              .build(&state.processor)
              .map_err(|source| DefinitionError::Processor {
                state: state.name.clone(),
                source,
              })?;
          slots.push(ProcessorSlot {
            spec: processor.spec(),
            processor: Mutex::new(processor),
          });
          slot_by_spec.insert(key, slots.len() - 1);
          slots.len() - 1
        }
      };

      let transitions = state
        .transitions
        .iter()
        .map(|t| Transition {
          when: t.when.clone(),
          // 目标在 validate 中已确认存在
          target: index[&t.next_state],
          output: t.output.clone(),
        })
        .collect();

      states.push(State {
        name: state.name.clone(),
        slot,
        transitions,
      });
    }

    let initial = index[&definition.initial_state];
    info!(
      "状态机构建完成: {} 个状态, {} 个处理器, 初始状态 {}",
      states.len(),
      slots.len(),
      definition.initial_state
    );

    Ok(Self {
      slots,
      states,
      index,
      initial,
      current: initial,
    })
  }

  /// 处理一帧；失败时当前状态保持不变
  pub fn step(&mut self, frame: &BgrFrame) -> Result<Step, StepError> {
    let state = &self.states[self.current];
    let slot = &self.slots[state.slot];

    let observation = {
      let processor = slot
        .processor
        .lock()
        .map_err(|_| StepError::ProcessorUnavailable {
          state: state.name.clone(),
        })?;
      processor.infer(frame).map_err(|e| match e {
        ProcessorError::InvalidInput(source) => StepError::InvalidInput {
          state: state.name.clone(),
          source,
        },
        source => StepError::Processor {
          state: state.name.clone(),
          source,
        },
      })?
    };

    let matched = state
      .transitions
      .iter()
      .find(|t| t.when.evaluate(&observation));

    match matched {
      Some(transition) => {
        debug!(
          "状态转移: {} -> {}",
          state.name, self.states[transition.target].name
        );
        let output = transition.output.clone();
        self.current = transition.target;
        Ok(Step {
          output,
          transitioned: true,
          observation,
        })
      }
      None => Ok(Step {
        output: None,
        transitioned: false,
        observation,
      }),
    }
  }

  /// 回到初始状态，不重建处理器
  pub fn reset(&mut self) {
    debug!("状态机复位到 {}", self.states[self.initial].name);
    self.current = self.initial;
  }

  pub fn current_state(&self) -> &str {
    &self.states[self.current].name
  }

  pub fn initial_state(&self) -> &str {
    &self.states[self.initial].name
  }

  pub fn state_names(&self) -> impl Iterator<Item = &str> {
    self.states.iter().map(|s| s.name.as_str())
  }

  pub fn processor_count(&self) -> usize {
    self.slots.len()
  }

  pub fn processor_spec(&self, state: &str) -> Option<&ProcessorSpec> {
    let idx = *self.index.get(state)?;
    Some(&self.slots[self.states[idx].slot].spec)
  }

  /// 按处理器记录的描述导出定义
  pub fn to_definition(&self) -> MachineDefinition {
    MachineDefinition {
      initial_state: self.initial_state().to_string(),
      states: self
        .states
        .iter()
        .map(|state| StateDefinition {
          name: state.name.clone(),
          processor: self.slots[state.slot].spec.clone(),
          transitions: state
            .transitions
            .iter()
            .map(|t| TransitionDefinition {
              when: t.when.clone(),
              next_state: self.states[t.target].name.clone(),
              output: t.output.clone(),
            })
            .collect(),
        })
        .collect(),
    }
  }

  pub fn into_shared(self) -> SharedStateMachine<P> {
    Arc::new(Mutex::new(self))
  }
}
