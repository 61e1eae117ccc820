// 该文件是 Zhiyin （指引） 项目的一部分。
// src/control.rs - 运行控制
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
  sync::{Arc, Mutex, PoisonError},
  thread::{self, JoinHandle},
};

use thiserror::Error;
use tracing::{error, info};

use crate::{
  frame::BgrFrame,
  machine::StateMachine,
  output::{Guidance, Render},
  processor::Processor,
  task::{ContinuousTask, RunSummary, StopSignal, Task},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
  Idle,
  Running,
  Finished(RunSummary),
  Failed(String),
}

#[derive(Error, Debug)]
pub enum ControlError {
  #[error("任务已在运行")]
  AlreadyRunning,
  #[error("无法创建运行线程: {0}")]
  Spawn(#[from] std::io::Error),
}

/// 在后台线程运行状态机，可随时查询状态或停止
#[derive(Debug)]
pub struct RunnerHandle {
  frame_number: Option<usize>,
  stop: StopSignal,
  status: Arc<Mutex<RunStatus>>,
  worker: Option<JoinHandle<()>>,
}

impl Default for RunnerHandle {
  fn default() -> Self {
    Self::new()
  }
}

impl RunnerHandle {
  pub fn new() -> Self {
    Self {
      frame_number: None,
      stop: StopSignal::new(),
      status: Arc::new(Mutex::new(RunStatus::Idle)),
      worker: None,
    }
  }

  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 当前运行对应的停止标志
  pub fn stop_signal(&self) -> StopSignal {
    self.stop.clone()
  }

  pub fn start<P, RE, I, O>(
    &mut self,
    mut machine: StateMachine<P>,
    source: I,
    sink: O,
  ) -> Result<(), ControlError>
  where
    P: Processor + Send + 'static,
    RE: std::error::Error + Send + Sync + 'static,
    I: Iterator<Item = BgrFrame> + Send + 'static,
    O: Render<BgrFrame, Guidance, Error = RE> + Send + 'static,
  {
    if self.status() == RunStatus::Running {
      return Err(ControlError::AlreadyRunning);
    }
    self.join_worker();

    self.stop = StopSignal::new();
    self.set_status(RunStatus::Running);

    let task = ContinuousTask::default()
      .with_frame_number(self.frame_number)
      .with_stop_signal(self.stop.clone());
    let status = self.status.clone();
    let spawned = thread::Builder::new()
      .name("zhiyin-runner".to_string())
      .spawn(move || {
        let result = match task.run_task(source, &mut machine, sink) {
          Ok(summary) => RunStatus::Finished(summary),
          Err(e) => {
            error!("任务失败: {}", e);
            RunStatus::Failed(e.to_string())
          }
        };
        *status.lock().unwrap_or_else(PoisonError::into_inner) = result;
      });

    match spawned {
      Ok(worker) => {
        info!("运行线程已启动");
        self.worker = Some(worker);
        Ok(())
      }
      Err(e) => {
        self.set_status(RunStatus::Idle);
        Err(e.into())
      }
    }
  }

  /// 线程结束后仍为 `Running` 说明线程未写入结果就退出了
  pub fn status(&self) -> RunStatus {
    let exited = self.worker.as_ref().is_some_and(JoinHandle::is_finished);
    let status = self
      .status
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    match status {
      RunStatus::Running if exited => RunStatus::Failed("运行线程异常退出".to_string()),
      status => status,
    }
  }

  /// 置位停止标志并等待线程结束；未启动或已停止时直接返回当前状态
  pub fn stop(&mut self) -> RunStatus {
    if self.worker.is_some() {
      info!("请求停止任务");
      self.stop.stop();
    }
    self.join_worker();
    self.status()
  }

  /// 不发出停止请求，等待任务自然结束
  pub fn wait(&mut self) -> RunStatus {
    self.join_worker();
    self.status()
  }

  fn join_worker(&mut self) {
    if let Some(worker) = self.worker.take()
      && worker.join().is_err()
    {
      error!("运行线程异常退出");
      self.set_status(RunStatus::Failed("运行线程异常退出".to_string()));
    }
  }

  fn set_status(&self, status: RunStatus) {
    *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
  }
}

impl Drop for RunnerHandle {
  fn drop(&mut self) {
    self.stop();
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::task::tests::{CollectingOutput, ping_pong};

  #[test]
  fn never_started_handle_is_idle() {
    let mut handle = RunnerHandle::new();
    assert_eq!(handle.status(), RunStatus::Idle);
    assert_eq!(handle.stop(), RunStatus::Idle);
    assert_eq!(handle.stop(), RunStatus::Idle);
  }

  #[test]
  fn finite_source_finishes_with_summary() {
    let mut handle = RunnerHandle::new();
    let frames: Vec<_> = (0..4).map(|_| BgrFrame::with_shape(2, 2)).collect();
    handle
      .start(ping_pong(), frames.into_iter(), CollectingOutput::default())
      .unwrap();

    match handle.wait() {
      RunStatus::Finished(summary) => {
        assert_eq!(summary.frames, 4);
        assert_eq!(summary.emitted, 4);
      }
      other => panic!("unexpected status {other:?}"),
    }
  }

  #[test]
  fn stop_is_idempotent() {
    let mut handle = RunnerHandle::new();
    let frames = std::iter::repeat_with(|| {
      std::thread::sleep(Duration::from_millis(1));
      BgrFrame::with_shape(2, 2)
    });
    handle
      .start(ping_pong(), frames, CollectingOutput::default())
      .unwrap();
    assert!(matches!(
      handle.start(ping_pong(), std::iter::empty(), CollectingOutput::default()),
      Err(ControlError::AlreadyRunning)
    ));

    let first = handle.stop();
    assert!(matches!(first, RunStatus::Finished(_)));
    assert_eq!(handle.stop(), first);
    assert_eq!(handle.status(), first);
  }

  #[test]
  fn polled_status_never_reports_failure_for_successful_runs() {
    for _ in 0..200 {
      let mut handle = RunnerHandle::new();
      handle
        .start(
          ping_pong(),
          std::iter::once(BgrFrame::with_shape(2, 2)),
          CollectingOutput::default(),
        )
        .unwrap();

      let polled = loop {
        match handle.status() {
          RunStatus::Running => std::thread::yield_now(),
          other => break other,
        }
      };
      assert!(matches!(polled, RunStatus::Finished(_)), "polled {polled:?}");
      assert_eq!(handle.wait(), polled);
    }
  }

  #[test]
  fn panicking_run_is_reported_as_failed() {
    let mut handle = RunnerHandle::new();
    let frames = std::iter::repeat_with(|| -> BgrFrame { panic!("source exploded") });
    handle
      .start(ping_pong(), frames, CollectingOutput::default())
      .unwrap();

    while handle.status() == RunStatus::Running {
      std::thread::yield_now();
    }
    assert!(matches!(handle.status(), RunStatus::Failed(_)));
    assert!(matches!(handle.wait(), RunStatus::Failed(_)));
  }

  #[test]
  fn can_restart_after_finishing() {
    let mut handle = RunnerHandle::new().with_frame_number(Some(2));
    let frames = std::iter::repeat_with(|| BgrFrame::with_shape(2, 2));
    handle
      .start(ping_pong(), frames, CollectingOutput::default())
      .unwrap();
    assert!(matches!(handle.wait(), RunStatus::Finished(s) if s.frames == 2));

    handle
      .start(
        ping_pong(),
        std::iter::once(BgrFrame::with_shape(2, 2)),
        CollectingOutput::default(),
      )
      .unwrap();
    assert!(matches!(handle.wait(), RunStatus::Finished(s) if s.frames == 1));
  }
}
