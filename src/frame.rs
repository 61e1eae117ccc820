// 该文件是 Zhiyin （指引） 项目的一部分。
// src/frame.rs - BGR 帧定义
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

use image::{ImageBuffer, Rgb, RgbImage, imageops::FilterType};
use thiserror::Error;

pub const BGR_CHANNELS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("不支持的帧形状: {height}x{width}x{channels}, 需要 HxWx3 的 BGR 图像")]
  UnsupportedShape {
    height: usize,
    width: usize,
    channels: usize,
  },
}

/// HWC 排列的帧，通道顺序与外部视觉库保持一致（BGR）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgrFrame {
  height: usize,
  width: usize,
  channels: usize,
  data: Box<[u8]>,
}

impl BgrFrame {
  /// 由原始字节构造，只校验长度；形状是否受支持由处理器在推理时判断
  pub fn from_raw(
    height: usize,
    width: usize,
    channels: usize,
    data: Vec<u8>,
  ) -> Result<Self, FrameError> {
    let expected = height * width * channels;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      height,
      width,
      channels,
      data: data.into_boxed_slice(),
    })
  }

  pub fn with_shape(height: usize, width: usize) -> Self {
    Self::filled(height, width, [0, 0, 0])
  }

  pub fn filled(height: usize, width: usize, bgr: [u8; 3]) -> Self {
    let data = bgr
      .iter()
      .copied()
      .cycle()
      .take(height * width * BGR_CHANNELS)
      .collect::<Vec<_>>();
    Self {
      height,
      width,
      channels: BGR_CHANNELS,
      data: data.into_boxed_slice(),
    }
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn channels(&self) -> usize {
    self.channels
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  /// 返回 (y, x) 处像素的全部通道
  pub fn pixel(&self, y: usize, x: usize) -> &[u8] {
    let idx = (y * self.width + x) * self.channels;
    &self.data[idx..idx + self.channels]
  }

  pub fn ensure_bgr(&self) -> Result<(), FrameError> {
    if self.height == 0 || self.width == 0 || self.channels != BGR_CHANNELS {
      return Err(FrameError::UnsupportedShape {
        height: self.height,
        width: self.width,
        channels: self.channels,
      });
    }
    Ok(())
  }

  /// 按比例双线性缩放，长宽比保持不变
  pub fn resize(&self, scale: f32) -> Result<BgrFrame, FrameError> {
    self.ensure_bgr()?;
    let width = ((self.width as f32 * scale).round() as u32).max(1);
    let height = ((self.height as f32 * scale).round() as u32).max(1);

    // 缩放与通道顺序无关，直接借用 RGB 缓冲区
    let buffer: RgbImage = self.as_image_buffer()?;
    let resized = image::imageops::resize(&buffer, width, height, FilterType::Triangle);

    BgrFrame::from_raw(
      height as usize,
      width as usize,
      BGR_CHANNELS,
      resized.into_raw(),
    )
  }

  /// 转为 RGB 图像（交换 B 与 R 通道）
  pub fn to_rgb_image(&self) -> Result<RgbImage, FrameError> {
    self.ensure_bgr()?;
    Ok(ImageBuffer::from_fn(
      self.width as u32,
      self.height as u32,
      |x, y| {
        let p = self.pixel(y as usize, x as usize);
        Rgb([p[2], p[1], p[0]])
      },
    ))
  }

  fn as_image_buffer(&self) -> Result<RgbImage, FrameError> {
    ImageBuffer::from_raw(self.width as u32, self.height as u32, self.data.to_vec()).ok_or(
      FrameError::LengthMismatch {
        expected: self.height * self.width * BGR_CHANNELS,
        actual: self.data.len(),
      },
    )
  }
}

impl From<RgbImage> for BgrFrame {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    let mut data = image.into_raw();
    for pixel in data.chunks_exact_mut(BGR_CHANNELS) {
      pixel.swap(0, 2);
    }

    Self {
      height: height as usize,
      width: width as usize,
      channels: BGR_CHANNELS,
      data: data.into_boxed_slice(),
    }
  }
}
