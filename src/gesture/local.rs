use anyhow::{Context, Result};
use ndarray::{Array2, ArrayViewD};
use opencv::{core::Mat, prelude::*};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;

use super::landmarks::{
    hand_region, normalize_features, run_landmark_model, Keypoint, BODY_KEYPOINT_COUNT,
    HAND_KEYPOINT_COUNT, LEFT_ELBOW, LEFT_WRIST, RIGHT_ELBOW, RIGHT_WRIST,
};
use super::{GestureClassifier, GestureLabel};

/// 分類器出力インデックス → ラベルの対応表（学習時のアルファベット順）
const CLASS_MAP: [GestureLabel; 6] = [
    GestureLabel::ArmsCrossed,
    GestureLabel::None,
    GestureLabel::OneArmUp,
    GestureLabel::Peace,
    GestureLabel::ThumbsDown,
    GestureLabel::ThumbsUp,
];

/// ローカル3モデル構成のジェスチャー認識
///
/// 体ポーズ(17点) → 必要なら手ポーズ(21点) → 正規化特徴ベクトル →
/// 分類器、の順に実行する。モデルは全てコンストラクタで読み込む。
pub struct LocalPipelineClassifier {
    body_pose: Session,
    hand_pose: Session,
    classifier: Session,
}

impl LocalPipelineClassifier {
    pub fn new<P: AsRef<Path>>(
        body_pose_path: P,
        hand_pose_path: P,
        classifier_path: P,
    ) -> Result<Self> {
        Ok(Self {
            body_pose: load_session(body_pose_path.as_ref())
                .context("Failed to load body pose model")?,
            hand_pose: load_session(hand_pose_path.as_ref())
                .context("Failed to load hand pose model")?,
            classifier: load_session(classifier_path.as_ref())
                .context("Failed to load gesture classifier model")?,
        })
    }

    /// 手首が肘より上がっている側の手ROIを検査し、21点キーポイントを得る
    ///
    /// 左腕優先。ROIが退化している場合は全点ゼロのまま返す。
    fn probe_hand(
        &mut self,
        crop: &Mat,
        pose: &[Keypoint],
    ) -> Result<(Vec<Keypoint>, Vec<Keypoint>)> {
        let mut left_hand = vec![Keypoint::default(); HAND_KEYPOINT_COUNT];
        let mut right_hand = vec![Keypoint::default(); HAND_KEYPOINT_COUNT];

        let left_up = pose[LEFT_WRIST].is_visible() && pose[LEFT_WRIST].y < pose[LEFT_ELBOW].y;
        let right_up = pose[RIGHT_WRIST].is_visible() && pose[RIGHT_WRIST].y < pose[RIGHT_ELBOW].y;
        if !left_up && !right_up {
            return Ok((left_hand, right_hand));
        }

        let (wrist, elbow) = if left_up {
            (&pose[LEFT_WRIST], &pose[LEFT_ELBOW])
        } else {
            (&pose[RIGHT_WRIST], &pose[RIGHT_ELBOW])
        };

        let Some(roi) = hand_region(wrist, elbow, crop.cols(), crop.rows()) else {
            return Ok((left_hand, right_hand));
        };

        let hand_frame = Mat::roi(crop, roi)?.try_clone()?;
        let keypoints = run_landmark_model(
            &mut self.hand_pose,
            &hand_frame,
            HAND_KEYPOINT_COUNT,
            roi.x as f32,
            roi.y as f32,
        )?;

        if left_up {
            left_hand = keypoints;
        } else {
            right_hand = keypoints;
        }
        Ok((left_hand, right_hand))
    }

    /// 特徴ベクトルを分類器にかけ、ラベル表を引く
    fn classify_features(&mut self, features: Vec<f32>) -> Result<GestureLabel> {
        let input = Array2::from_shape_vec((1, features.len()), features)?;
        let input_tensor = Tensor::from_array(input)?;
        let outputs = self
            .classifier
            .run(ort::inputs!["float_input" => input_tensor])
            .context("Gesture classifier inference failed")?;

        let label: ArrayViewD<i64> = outputs["label"]
            .try_extract_array()
            .context("Failed to extract classifier output")?;
        let index = label.iter().copied().next().unwrap_or(-1);

        // 範囲外インデックスはNONE
        Ok(usize::try_from(index)
            .ok()
            .and_then(|i| CLASS_MAP.get(i).copied())
            .unwrap_or(GestureLabel::None))
    }
}

impl GestureClassifier for LocalPipelineClassifier {
    fn recognize(&mut self, crop: &Mat) -> Result<GestureLabel> {
        let pose = run_landmark_model(&mut self.body_pose, crop, BODY_KEYPOINT_COUNT, 0.0, 0.0)?;
        let (left_hand, right_hand) = self.probe_hand(crop, &pose)?;
        let features = normalize_features(&pose, &left_hand, &right_hand);
        self.classify_features(features)
    }
}

fn load_session(path: &Path) -> Result<Session> {
    Ok(Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_map_order() {
        // 学習時のアルファベット順と一致すること
        assert_eq!(CLASS_MAP[0], GestureLabel::ArmsCrossed);
        assert_eq!(CLASS_MAP[1], GestureLabel::None);
        assert_eq!(CLASS_MAP[2], GestureLabel::OneArmUp);
        assert_eq!(CLASS_MAP[3], GestureLabel::Peace);
        assert_eq!(CLASS_MAP[4], GestureLabel::ThumbsDown);
        assert_eq!(CLASS_MAP[5], GestureLabel::ThumbsUp);
    }
}
