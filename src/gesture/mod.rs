pub mod heuristic;
pub mod landmarks;
pub mod local;
pub mod remote;

use std::sync::Arc;

use anyhow::{bail, Result};
use opencv::{
    core::{Mat, Vector},
    imgcodecs,
};
use serde::Deserialize;

use crate::actuate::ActuationGateway;
use crate::config::{Config, GestureBackend};

pub use heuristic::PoseRemoteClassifier;
pub use landmarks::Keypoint;
pub use local::LocalPipelineClassifier;
pub use remote::RemoteClassifier;

/// 認識対象のジェスチャー語彙
///
/// NONE は常にデフォルト値・失敗値を兼ねる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureLabel {
    None,
    ArmsCrossed,
    OneArmUp,
    Peace,
    ThumbsUp,
    ThumbsDown,
}

impl GestureLabel {
    /// リモートサービスが返すラベル文字列からの変換。未知の文字列はNONE。
    pub fn from_name(name: &str) -> Self {
        match name {
            "ARMS_CROSSED" => Self::ArmsCrossed,
            "ONE_ARM_UP" => Self::OneArmUp,
            "PEACE" => Self::Peace,
            "THUMBS_UP" => Self::ThumbsUp,
            "THUMBS_DOWN" => Self::ThumbsDown,
            _ => Self::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::ArmsCrossed => "ARMS_CROSSED",
            Self::OneArmUp => "ONE_ARM_UP",
            Self::Peace => "PEACE",
            Self::ThumbsUp => "THUMBS_UP",
            Self::ThumbsDown => "THUMBS_DOWN",
        }
    }
}

/// ジェスチャー認識ストラテジの共通インタフェース
///
/// 3実装（ローカルパイプライン、ポーズ+リモート、完全委譲）を
/// 起動時の設定で差し替える。ワーカーはどの実装かを知らない。
pub trait GestureClassifier: Send {
    /// 人物クロップからジェスチャーを判定する
    ///
    /// リモート側の失敗や不正応答はNONEに落とし、エラーにはしない。
    /// 推論自体の失敗のみErrを返す（呼び出し側でログしてNONE扱い）。
    fn recognize(&mut self, crop: &Mat) -> Result<GestureLabel>;
}

/// 設定に従ってストラテジを組み立てる
pub fn build_classifier(
    config: &Config,
    gateway: Arc<ActuationGateway>,
) -> Result<Box<dyn GestureClassifier + Send>> {
    match config.gesture_backend {
        GestureBackend::Local => {
            let (Some(body), Some(hand), Some(classifier)) = (
                config.models.body_pose.as_deref(),
                config.models.hand_pose.as_deref(),
                config.models.classifier.as_deref(),
            ) else {
                bail!("local gesture backend requires all three model paths");
            };
            Ok(Box::new(LocalPipelineClassifier::new(body, hand, classifier)?))
        }
        GestureBackend::PoseRemote => {
            let Some(body) = config.models.body_pose.as_deref() else {
                bail!("pose_remote gesture backend requires a body_pose model path");
            };
            Ok(Box::new(PoseRemoteClassifier::new(body, gateway)?))
        }
        GestureBackend::Remote => Ok(Box::new(RemoteClassifier::new(gateway))),
    }
}

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    gesture: String,
}

/// リモート認識サービスの応答JSONをラベルに変換する
///
/// パース不能な応答はNONE（エラーは伝播させない）。
pub(crate) fn parse_remote_label(body: &str) -> GestureLabel {
    match serde_json::from_str::<RecognizeResponse>(body) {
        Ok(response) => GestureLabel::from_name(&response.gesture),
        Err(e) => {
            log::warn!("Unparseable gesture response ({e}): {body}");
            GestureLabel::None
        }
    }
}

/// クロップをJPEGにエンコードする（リモート送信用）
pub(crate) fn encode_jpeg(frame: &Mat) -> Result<Vec<u8>> {
    let mut buf: Vector<u8> = Vector::new();
    imgcodecs::imencode(".jpg", frame, &mut buf, &Vector::new())?;
    Ok(buf.to_vec())
}
