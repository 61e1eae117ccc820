// 该文件是 Zhiyin （指引） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::path::PathBuf;

use clap::Parser;
use url::Url;

/// Zhiyin 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 状态机定义文件（JSON）
  #[arg(long, value_name = "FILE")]
  pub definition: PathBuf,

  /// 输入来源
  /// 支持格式:
  /// - 单张图片: image:///path/to/frame.png
  /// - 图片目录: folder:///path/to/frames
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 指引输出
  /// 支持格式:
  /// - 日志: log:
  /// - JSON Lines 文件: jsonl:///path/to/guidance.jsonl
  /// - 标准输出: stdout:
  #[arg(long, value_name = "OUTPUT", default_value = "log:")]
  pub output: Url,

  /// 最大处理帧数
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,

  /// 检测结果调试图像目录（需要 debug_draw 特性）
  #[arg(long, value_name = "DIR", env = "ZHIYIN_DEBUG_DIR")]
  pub debug_dir: Option<PathBuf>,
}
