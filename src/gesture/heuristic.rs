use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use opencv::{core::Mat, prelude::*};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;

use super::landmarks::{
    hand_region, run_landmark_model, Keypoint, BODY_KEYPOINT_COUNT, LEFT_ELBOW, LEFT_SHOULDER,
    LEFT_WRIST, RIGHT_ELBOW, RIGHT_SHOULDER, RIGHT_WRIST,
};
use super::{encode_jpeg, parse_remote_label, GestureClassifier, GestureLabel};
use crate::actuate::ActuationGateway;

/// ポーズ幾何 + リモート手判定のジェスチャー認識
///
/// 体ポーズだけをローカルで走らせ、腕交差・片腕上げはキーポイント
/// 幾何から直接判定する。腕が上がっているときは手領域をリモートの
/// 認識サービスへ送り、PEACE/THUMBS_UP/THUMBS_DOWN に絞り込む。
/// リモート側の失敗は幾何判定の結果にフォールバックする。
pub struct PoseRemoteClassifier {
    body_pose: Session,
    gateway: Arc<ActuationGateway>,
}

impl PoseRemoteClassifier {
    pub fn new<P: AsRef<Path>>(body_pose_path: P, gateway: Arc<ActuationGateway>) -> Result<Self> {
        let body_pose = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(body_pose_path.as_ref())
            .context("Failed to load body pose model")?;
        Ok(Self { body_pose, gateway })
    }

    /// 上がっている腕の手領域をリモートで判定する
    fn refine_hand(&self, crop: &Mat, pose: &[Keypoint]) -> GestureLabel {
        let left_up = pose[LEFT_WRIST].is_visible() && pose[LEFT_WRIST].y < pose[LEFT_ELBOW].y;
        let (wrist, elbow) = if left_up {
            (&pose[LEFT_WRIST], &pose[LEFT_ELBOW])
        } else {
            (&pose[RIGHT_WRIST], &pose[RIGHT_ELBOW])
        };

        let Some(roi) = hand_region(wrist, elbow, crop.cols(), crop.rows()) else {
            return GestureLabel::None;
        };

        let hand_frame = match Mat::roi(crop, roi).and_then(|m| m.try_clone()) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Failed to crop hand region: {e}");
                return GestureLabel::None;
            }
        };

        let jpeg = match encode_jpeg(&hand_frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode hand crop: {e}");
                return GestureLabel::None;
            }
        };

        let label = parse_remote_label(&self.gateway.classify_image(jpeg));
        match label {
            GestureLabel::Peace | GestureLabel::ThumbsUp | GestureLabel::ThumbsDown => label,
            _ => GestureLabel::None,
        }
    }
}

impl GestureClassifier for PoseRemoteClassifier {
    fn recognize(&mut self, crop: &Mat) -> Result<GestureLabel> {
        let pose = run_landmark_model(&mut self.body_pose, crop, BODY_KEYPOINT_COUNT, 0.0, 0.0)?;

        match classify_pose_geometry(&pose) {
            GestureLabel::ArmsCrossed => Ok(GestureLabel::ArmsCrossed),
            GestureLabel::OneArmUp => {
                // 手の詳細が取れればそちらを優先、だめなら片腕上げのまま
                match self.refine_hand(crop, &pose) {
                    GestureLabel::None => Ok(GestureLabel::OneArmUp),
                    refined => Ok(refined),
                }
            }
            other => Ok(other),
        }
    }
}

/// キーポイント幾何だけでの判定
///
/// 腕交差: 両手首が反対側の肩のxを越えている（左右どちらの向きでも可）。
/// 片腕上げ: 手首が同じ側の肩より上。どちらも信頼度0.5でゲートする。
pub(crate) fn classify_pose_geometry(pose: &[Keypoint]) -> GestureLabel {
    if pose.len() != BODY_KEYPOINT_COUNT {
        return GestureLabel::None;
    }

    let ls = &pose[LEFT_SHOULDER];
    let rs = &pose[RIGHT_SHOULDER];
    let lw = &pose[LEFT_WRIST];
    let rw = &pose[RIGHT_WRIST];

    if ls.is_visible() && rs.is_visible() && lw.is_visible() && rw.is_visible() {
        // 画像上の肩の並び（ミラーの有無）に依らず判定する
        let crossed = if ls.x <= rs.x {
            lw.x > rs.x && rw.x < ls.x
        } else {
            lw.x < rs.x && rw.x > ls.x
        };
        if crossed {
            return GestureLabel::ArmsCrossed;
        }
    }

    let left_raised = lw.is_visible() && ls.is_visible() && lw.y < ls.y;
    let right_raised = rw.is_visible() && rs.is_visible() && rw.y < rs.y;
    if left_raised || right_raised {
        return GestureLabel::OneArmUp;
    }

    GestureLabel::None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_pose() -> Vec<Keypoint> {
        let mut pose = vec![Keypoint::default(); BODY_KEYPOINT_COUNT];
        // 画像座標: 左肩が画面左
        pose[LEFT_SHOULDER] = Keypoint::new(100.0, 100.0, 0.9);
        pose[RIGHT_SHOULDER] = Keypoint::new(200.0, 100.0, 0.9);
        pose[LEFT_ELBOW] = Keypoint::new(90.0, 150.0, 0.9);
        pose[RIGHT_ELBOW] = Keypoint::new(210.0, 150.0, 0.9);
        pose[LEFT_WRIST] = Keypoint::new(80.0, 200.0, 0.9);
        pose[RIGHT_WRIST] = Keypoint::new(220.0, 200.0, 0.9);
        pose
    }

    #[test]
    fn test_neutral_pose_is_none() {
        assert_eq!(classify_pose_geometry(&base_pose()), GestureLabel::None);
    }

    #[test]
    fn test_arms_crossed() {
        let mut pose = base_pose();
        // 両手首が反対側の肩を越える
        pose[LEFT_WRIST] = Keypoint::new(220.0, 150.0, 0.9);
        pose[RIGHT_WRIST] = Keypoint::new(80.0, 150.0, 0.9);
        assert_eq!(classify_pose_geometry(&pose), GestureLabel::ArmsCrossed);
    }

    #[test]
    fn test_arms_crossed_mirrored() {
        let mut pose = base_pose();
        // ミラー映像（左肩が画面右）でも判定できる
        pose[LEFT_SHOULDER] = Keypoint::new(200.0, 100.0, 0.9);
        pose[RIGHT_SHOULDER] = Keypoint::new(100.0, 100.0, 0.9);
        pose[LEFT_WRIST] = Keypoint::new(80.0, 150.0, 0.9);
        pose[RIGHT_WRIST] = Keypoint::new(220.0, 150.0, 0.9);
        assert_eq!(classify_pose_geometry(&pose), GestureLabel::ArmsCrossed);
    }

    #[test]
    fn test_one_arm_up() {
        let mut pose = base_pose();
        pose[RIGHT_WRIST] = Keypoint::new(210.0, 50.0, 0.9);
        assert_eq!(classify_pose_geometry(&pose), GestureLabel::OneArmUp);
    }

    #[test]
    fn test_low_confidence_is_gated() {
        let mut pose = base_pose();
        // 手首が上がっていても信頼度が低ければNONE
        pose[RIGHT_WRIST] = Keypoint::new(210.0, 50.0, 0.3);
        assert_eq!(classify_pose_geometry(&pose), GestureLabel::None);
    }
}
