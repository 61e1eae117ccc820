// 该文件是 Zhiyin （指引） 项目的一部分。
// src/task.rs - 任务执行
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
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  frame::BgrFrame,
  machine::{StateMachine, StepError},
  output::{Guidance, Render},
  processor::Processor,
};

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, machine: M, output: O) -> Result<Self::Output, Self::Error>;
}

/// 停止标志，只在两帧之间检查
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn stop(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_stopped(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  /// Ctrl-C 时置位；30 秒后仍未退出则强制结束进程
  pub fn install_ctrlc_handler(&self) -> Result<(), ctrlc::Error> {
    let signal = self.clone();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      signal.stop();
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
  /// 成功完成一步的帧数
  pub frames: u64,
  /// 因输入无效而跳过的帧数
  pub skipped: u64,
  /// 发出的指引条数
  pub emitted: u64,
  pub transitions: u64,
}

#[derive(Error, Debug)]
pub enum RunError {
  #[error(transparent)]
  Step(#[from] StepError),
  #[error("输出失败: {0}")]
  Output(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  stop: StopSignal,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
    self.stop = stop;
    self
  }
}

impl<'m, P, RE, I, O> Task<I, &'m mut StateMachine<P>, O> for ContinuousTask
where
  P: Processor,
  RE: std::error::Error + Send + Sync + 'static,
  I: Iterator<Item = BgrFrame>,
  O: Render<BgrFrame, Guidance, Error = RE>,
{
  type Output = RunSummary;
  type Error = RunError;

  fn run_task(
    self,
    input: I,
    machine: &'m mut StateMachine<P>,
    output: O,
  ) -> Result<RunSummary, RunError> {
    info!("开始任务，初始状态: {}", machine.current_state());
    let mut summary = RunSummary::default();
    let mut frame_index: u64 = 0;

    let mut input = input;
    loop {
      // 先检查停止标志再取帧，停止时不消耗来源中的帧
      if self.stop.is_stopped() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
      let Some(frame) = input.next() else {
        break;
      };

      let now = Instant::now();
      let from_state = machine.current_state().to_string();
      match machine.step(&frame) {
        Ok(step) => {
          summary.frames += 1;
          if step.transitioned {
            summary.transitions += 1;
          }
          debug!(
            "第 {} 帧: 状态 {} 观测 {} 类，耗时 {:.2?}",
            frame_index,
            from_state,
            step.observation.len(),
            now.elapsed()
          );
          if let Some(payload) = step.output {
            let guidance = Guidance {
              frame_index,
              from_state,
              to_state: machine.current_state().to_string(),
              payload,
            };
            output
              .render_result(&frame, &guidance)
              .map_err(|e| RunError::Output(Box::new(e)))?;
            summary.emitted += 1;
          }
        }
        Err(e @ StepError::InvalidInput { .. }) => {
          warn!("跳过第 {} 帧: {}", frame_index, e);
          summary.skipped += 1;
        }
        Err(e) => return Err(e.into()),
      }

      frame_index += 1;
      if self
        .frame_number
        .is_some_and(|n| frame_index >= n as u64)
      {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
    }

    info!(
      "任务完成: 处理 {} 帧，跳过 {} 帧，转移 {} 次，指引 {} 条",
      summary.frames, summary.skipped, summary.transitions, summary.emitted
    );
    Ok(summary)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use std::{convert::Infallible, sync::Mutex};

  use serde_json::json;

  use super::*;
  use crate::{
    machine::MachineDefinition,
    processor::{ProcessorWrapper, Registry},
  };

  /// 收集全部指引的输出端
  #[derive(Default)]
  pub(crate) struct CollectingOutput(pub(crate) Arc<Mutex<Vec<Guidance>>>);

  impl Render<BgrFrame, Guidance> for CollectingOutput {
    type Error = Infallible;

    fn render_result(&self, _frame: &BgrFrame, result: &Guidance) -> Result<(), Self::Error> {
      self.0.lock().unwrap().push(result.clone());
      Ok(())
    }
  }

  /// a 与 b 两个状态来回切换，每次转移都带输出
  pub(crate) fn ping_pong() -> StateMachine<ProcessorWrapper> {
    let definition = MachineDefinition::from_json_str(
      &json!({
        "initial_state": "a",
        "states": [
          {
            "name": "a",
            "processor": { "type": "DummyProcessor" },
            "transitions": [{ "next_state": "b", "output": { "audio": "to_b" } }]
          },
          {
            "name": "b",
            "processor": { "type": "DummyProcessor" },
            "transitions": [{ "next_state": "a", "output": { "audio": "to_a" } }]
          }
        ]
      })
      .to_string(),
    )
    .unwrap();
    StateMachine::from_definition(&definition, &Registry::new()).unwrap()
  }

  fn broken_frame() -> BgrFrame {
    BgrFrame::from_raw(2, 2, 1, vec![0; 4]).unwrap()
  }

  #[test]
  fn emits_guidance_for_each_transition() {
    let mut machine = ping_pong();
    let output = CollectingOutput::default();
    let collected = output.0.clone();
    let frames = std::iter::repeat_with(|| BgrFrame::with_shape(2, 2)).take(3);

    let summary = ContinuousTask::default()
      .run_task(frames, &mut machine, output)
      .unwrap();

    assert_eq!(
      summary,
      RunSummary {
        frames: 3,
        skipped: 0,
        emitted: 3,
        transitions: 3
      }
    );
    let collected = collected.lock().unwrap();
    assert_eq!(collected[0].from_state, "a");
    assert_eq!(collected[0].to_state, "b");
    assert_eq!(collected[1].payload, json!({ "audio": "to_a" }));
    assert_eq!(collected[2].frame_index, 2);
    assert_eq!(machine.current_state(), "b");
  }

  #[test]
  fn skips_invalid_frames() {
    let mut machine = ping_pong();
    let output = CollectingOutput::default();
    let collected = output.0.clone();
    let frames = vec![
      broken_frame(),
      BgrFrame::with_shape(2, 2),
      broken_frame(),
    ];

    let summary = ContinuousTask::default()
      .run_task(frames.into_iter(), &mut machine, output)
      .unwrap();

    assert_eq!(summary.frames, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.emitted, 1);
    let collected = collected.lock().unwrap();
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].frame_index, 1);
    assert_eq!(machine.current_state(), "b");
  }

  #[test]
  fn honours_frame_limit() {
    let mut machine = ping_pong();
    let frames = std::iter::repeat_with(|| BgrFrame::with_shape(2, 2));

    let summary = ContinuousTask::default()
      .with_frame_number(Some(5))
      .run_task(frames, &mut machine, CollectingOutput::default())
      .unwrap();

    assert_eq!(summary.frames, 5);
  }

  #[test]
  fn frame_limit_counts_skipped_frames() {
    let mut machine = ping_pong();
    let frames = std::iter::repeat_with(broken_frame);

    let summary = ContinuousTask::default()
      .with_frame_number(Some(3))
      .run_task(frames, &mut machine, CollectingOutput::default())
      .unwrap();

    assert_eq!(summary.frames, 0);
    assert_eq!(summary.skipped, 3);
  }

  #[test]
  fn stops_between_frames() {
    let mut machine = ping_pong();
    let stop = StopSignal::new();
    let trigger = stop.clone();
    let frames = std::iter::repeat_with(|| BgrFrame::with_shape(2, 2))
      .enumerate()
      .map(move |(i, frame)| {
        if i == 4 {
          trigger.stop();
        }
        frame
      });

    let summary = ContinuousTask::default()
      .with_stop_signal(stop)
      .run_task(frames, &mut machine, CollectingOutput::default())
      .unwrap();

    // 置位时已取出的帧照常处理完
    assert_eq!(summary.frames, 5);
  }

  /// 第一条指引输出后置位停止标志
  struct StopAfterFirst(StopSignal);

  impl Render<BgrFrame, Guidance> for StopAfterFirst {
    type Error = Infallible;

    fn render_result(&self, _frame: &BgrFrame, _result: &Guidance) -> Result<(), Self::Error> {
      self.0.stop();
      Ok(())
    }
  }

  #[test]
  fn stop_does_not_consume_next_frame() {
    let mut machine = ping_pong();
    let stop = StopSignal::new();
    let mut frames = (0..3).map(|_| BgrFrame::with_shape(2, 2));

    let summary = ContinuousTask::default()
      .with_stop_signal(stop.clone())
      .run_task(frames.by_ref(), &mut machine, StopAfterFirst(stop))
      .unwrap();

    assert_eq!(summary.frames, 1);
    assert_eq!(frames.count(), 2);
  }

  #[test]
  fn already_stopped_processes_nothing() {
    let mut machine = ping_pong();
    let stop = StopSignal::new();
    stop.stop();

    let summary = ContinuousTask::default()
      .with_stop_signal(stop)
      .run_task(
        std::iter::once(BgrFrame::with_shape(2, 2)),
        &mut machine,
        CollectingOutput::default(),
      )
      .unwrap();

    assert_eq!(summary, RunSummary::default());
    assert_eq!(machine.current_state(), "a");
  }
}
