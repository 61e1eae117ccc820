// 该文件是 Zhiyin （指引） 项目的一部分。
// src/processor/draw.rs - 检测结果调试可视化
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
  path::PathBuf,
  sync::atomic::{AtomicU32, Ordering},
};

use ab_glyph::{FontRef, PxScale};
use chrono::{Datelike, Utc};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use tracing::{debug, warn};

use crate::{frame::BgrFrame, processor::Observation};

const BOX_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const BOX_THICKNESS: i32 = 2;

// 文本渲染常量
const FONT_DATA: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_TEXT_COLOR: [u8; 3] = [255, 255, 255];

/// 把检测框与 `类别: 置信度` 标签画在帧的副本上并按日期保存
pub struct DebugRecorder {
  directory: PathBuf,
  color: [u8; 3],
  font: Option<FontRef<'static>>,
  frame_counter: AtomicU32,
}

impl DebugRecorder {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    let font = match FontRef::try_from_slice(FONT_DATA) {
      Ok(font) => Some(font),
      Err(e) => {
        warn!("无法加载嵌入的字体文件，调试图像不绘制标签: {}", e);
        None
      }
    };

    Self {
      directory: directory.into(),
      color: BOX_COLOR,
      font,
      frame_counter: AtomicU32::new(0),
    }
  }

  fn frame_path(&self) -> std::io::Result<PathBuf> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    let id = self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
    Ok(directory.join(format!("{}-{:04X}.png", now.format("%H-%M-%S"), id)))
  }

  pub fn draw(&self, image: &mut RgbImage, observation: &Observation) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    for (class_name, detections) in observation.iter() {
      for d in detections {
        let x_min = (d.left.floor() as i32).clamp(0, w - 1);
        let y_min = (d.top.floor() as i32).clamp(0, h - 1);
        let x_max = (d.right.ceil() as i32).clamp(0, w - 1);
        let y_max = (d.bottom.ceil() as i32).clamp(0, h - 1);
        if x_min >= x_max || y_min >= y_max {
          continue;
        }

        // 绘制边框（加粗）
        for t in 0..BOX_THICKNESS {
          let (width, height) = (x_max - x_min - 2 * t, y_max - y_min - 2 * t);
          if width <= 0 || height <= 0 {
            break;
          }
          let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
          draw_hollow_rect_mut(image, rect, Rgb(self.color));
        }
        let label = format!("{}: {:.2}", class_name, d.confidence);
        self.draw_label(image, x_min, y_min, &label);
        debug!("{} at ({}, {}, {}, {})", label, x_min, y_min, x_max, y_max);
      }
    }
  }

  // 标签画在边框上方，背景与边框同色
  fn draw_label(&self, image: &mut RgbImage, x_min: i32, y_min: i32, label: &str) {
    let Some(font) = &self.font else {
      return;
    };

    let text_width = (label.chars().count() as f32 * LABEL_CHAR_WIDTH) as i32;
    let label_x = x_min.max(0);
    let label_y = (y_min - LABEL_TEXT_HEIGHT).max(0);

    let max_width = (image.width() as i32 - label_x).max(0);
    let label_width = text_width.min(max_width) as u32;
    let label_height = LABEL_TEXT_HEIGHT.min(image.height() as i32 - label_y).max(0) as u32;
    if label_width == 0 || label_height == 0 {
      return;
    }

    let rect = Rect::at(label_x, label_y).of_size(label_width, label_height);
    draw_filled_rect_mut(image, rect, Rgb(self.color));
    draw_text_mut(
      image,
      Rgb(LABEL_TEXT_COLOR),
      label_x,
      label_y + LABEL_TEXT_VERTICAL_PADDING,
      PxScale::from(LABEL_FONT_SIZE),
      font,
      label,
    );
  }

  /// 失败只记录日志，绝不影响推理结果
  pub fn record(&self, frame: &BgrFrame, observation: &Observation) {
    let mut image = match frame.to_rgb_image() {
      Ok(image) => image,
      Err(e) => {
        warn!("无法生成调试图像: {}", e);
        return;
      }
    };
    self.draw(&mut image, observation);

    let saved = self
      .frame_path()
      .map_err(|e| e.to_string())
      .and_then(|path| image.save(&path).map(|_| path).map_err(|e| e.to_string()));
    match saved {
      Ok(path) => debug!("保存调试图像到文件: {}", path.display()),
      Err(e) => warn!("保存调试图像失败: {}", e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::processor::Detection;

  #[test]
  fn draws_on_copy_and_saves_png() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = DebugRecorder::new(dir.path());
    let frame = BgrFrame::with_shape(20, 20);
    let observation = Observation::new().with(
      "cup",
      Detection {
        left: 2.0,
        top: 2.0,
        right: 12.0,
        bottom: 12.0,
        confidence: 0.9,
        class_id: 0,
      },
    );

    recorder.record(&frame, &observation);

    assert_eq!(frame, BgrFrame::with_shape(20, 20));
    let now = Utc::now();
    let day = dir
      .path()
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    let saved = std::fs::read_dir(day).expect("day directory").count();
    assert_eq!(saved, 1);
  }

  #[test]
  fn draw_marks_box_edges() {
    let recorder = DebugRecorder::new("unused");
    let mut image = RgbImage::new(20, 20);
    let observation = Observation::new().with(
      "cup",
      Detection {
        left: 2.0,
        top: 2.0,
        right: 12.0,
        bottom: 12.0,
        confidence: 0.9,
        class_id: 0,
      },
    );
    recorder.draw(&mut image, &observation);
    assert_eq!(image.get_pixel(2, 2).0, BOX_COLOR);
    assert_eq!(image.get_pixel(7, 7).0, [0, 0, 0]);
  }

  #[test]
  fn draw_writes_label_above_box() {
    let recorder = DebugRecorder::new("unused");
    assert!(recorder.font.is_some());
    let mut image = RgbImage::new(120, 80);
    let observation = Observation::new().with(
      "cup",
      Detection {
        left: 10.0,
        top: 40.0,
        right: 100.0,
        bottom: 70.0,
        confidence: 0.9,
        class_id: 0,
      },
    );
    recorder.draw(&mut image, &observation);

    // 标签区域为 y ∈ [16, 40)，顶部留白处只有背景色
    assert_eq!(image.get_pixel(10, 16).0, BOX_COLOR);
    let has_text = (10..100)
      .flat_map(|x| (18..40).map(move |y| (x, y)))
      .any(|(x, y)| image.get_pixel(x, y).0[0] > 128);
    assert!(has_text, "label text should be rendered in white");
    // 标签上方保持原样
    assert_eq!(image.get_pixel(10, 10).0, [0, 0, 0]);
  }
}
