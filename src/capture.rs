use anyhow::{Context, Result};
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureAPIs},
};

/// フレーム供給源の抽象
///
/// ワーカーはこのトレイト越しにキャプチャを扱う。
/// 再接続ロジックのテストでモック実装に差し替えられる。
pub trait VideoSource: Send {
    /// ソースを開く（再接続時は古いハンドルを破棄して開き直す）
    fn open(&mut self) -> Result<()>;

    /// 1フレーム読み込む。空フレームはエラー扱い。
    fn read_frame(&mut self) -> Result<Mat>;

    /// ソースを解放する。複数回呼んでも安全。
    fn release(&mut self);
}

/// OpenCV VideoCapture による実装
///
/// ロケータが整数ならデバイス番号、それ以外はURL/パスとして開く。
pub struct OpenCvSource {
    locator: String,
    capture: Option<VideoCapture>,
}

impl OpenCvSource {
    pub fn new(locator: &str) -> Self {
        Self {
            locator: locator.to_string(),
            capture: None,
        }
    }
}

impl VideoSource for OpenCvSource {
    fn open(&mut self) -> Result<()> {
        self.release();

        let mut capture = match self.locator.parse::<i32>() {
            Ok(index) => VideoCapture::new(index, VideoCaptureAPIs::CAP_ANY as i32)
                .with_context(|| format!("failed to open camera index {index}"))?,
            Err(_) => VideoCapture::from_file(&self.locator, VideoCaptureAPIs::CAP_ANY as i32)
                .with_context(|| format!("failed to open video source {:?}", self.locator))?,
        };

        if !capture.is_opened()? {
            anyhow::bail!("video source {:?} is not available", self.locator);
        }

        // 常に最新フレームを読むため内部バッファは最小にする
        capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0)?;

        self.capture = Some(capture);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Mat> {
        let capture = self
            .capture
            .as_mut()
            .context("video source is not open")?;

        let mut frame = Mat::default();
        capture
            .read(&mut frame)
            .context("Failed to read frame")?;

        if frame.empty() {
            anyhow::bail!("Empty frame received");
        }

        Ok(frame)
    }

    fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            let _ = capture.release();
        }
    }
}

impl Drop for OpenCvSource {
    fn drop(&mut self) {
        self.release();
    }
}
