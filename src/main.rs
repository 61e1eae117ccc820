// 该文件是 Zhiyin （指引） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use zhiyin::{
  FromUrl,
  control::{RunStatus, RunnerHandle},
  input::InputWrapper,
  machine::{MachineDefinition, StateMachine},
  output::OutputWrapper,
  processor::Registry,
};

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = args::Args::parse();

  info!("状态机定义: {}", args.definition.display());
  info!("输入来源: {}", args.input);
  info!("指引输出: {}", args.output);

  let registry = Registry::new().with_debug_dir(args.debug_dir);
  let definition = MachineDefinition::from_path(&args.definition)?;
  let machine = StateMachine::from_definition(&definition, &registry)?;
  info!(
    "状态机已加载: {} 个状态，{} 个处理器",
    machine.state_names().count(),
    machine.processor_count()
  );

  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let mut handle = RunnerHandle::new().with_frame_number(args.frame_number);
  handle.start(machine, input, output)?;
  handle.stop_signal().install_ctrlc_handler()?;

  match handle.wait() {
    RunStatus::Finished(summary) => {
      info!("运行结束: {:?}", summary);
      Ok(())
    }
    RunStatus::Failed(message) => bail!("运行失败: {}", message),
    status => bail!("运行状态异常: {:?}", status),
  }
}
