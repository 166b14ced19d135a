use anyhow::{Context, Result};
use ndarray::ArrayViewD;
use opencv::{core::Mat, core::Rect, prelude::*};
use ort::session::Session;
use ort::value::Tensor;

use crate::detect::{clamp_rect, to_nchw_tensor};

/// ポーズ/手モデルの入力解像度
pub(crate) const POSE_INPUT_SIZE: i32 = 640;

/// 体キーポイント数（COCO 17点レイアウト）
pub const BODY_KEYPOINT_COUNT: usize = 17;
/// 手キーポイント数（手首がインデックス0）
pub const HAND_KEYPOINT_COUNT: usize = 21;
/// 特徴ベクトル長: (17 + 21 + 21) * (x, y)
pub const FEATURE_LEN: usize = (BODY_KEYPOINT_COUNT + 2 * HAND_KEYPOINT_COUNT) * 2;

/// COCOレイアウトでの体の部位インデックス
pub const LEFT_SHOULDER: usize = 5;
pub const RIGHT_SHOULDER: usize = 6;
pub const LEFT_ELBOW: usize = 7;
pub const RIGHT_ELBOW: usize = 8;
pub const LEFT_WRIST: usize = 9;
pub const RIGHT_WRIST: usize = 10;
pub const LEFT_HIP: usize = 11;
pub const RIGHT_HIP: usize = 12;

/// キーポイントの可視性閾値（シグモイド後）
const VISIBILITY_THRESHOLD: f32 = 0.5;
/// 提案全体の信頼度閾値（シグモイドなしの生値）
const PROPOSAL_THRESHOLD: f32 = 0.5;
/// 手ROIを作る最小前腕長（ピクセル）
const MIN_FOREARM_LENGTH: f32 = 30.0;
/// 手ROIの最小辺長（これ以下は退化とみなす）
const MIN_HAND_SIDE: i32 = 20;

/// 単一キーポイント（クロップ内ピクセル座標）
///
/// confidence 0 は「観測なし」を意味し、そのとき座標は無意味。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    /// 信頼度が閾値以上か
    pub fn is_visible(&self) -> bool {
        self.confidence > VISIBILITY_THRESHOLD
    }
}

impl Default for Keypoint {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            confidence: 0.0,
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// YOLO-pose出力 [1, 5 + 3K, N] からキーポイント列を取り出す
///
/// 信頼度最大の提案のみを採用し、提案信頼度が閾値未満なら全点ゼロを返す。
/// 各キーポイントは可視性ロジットをシグモイドに通して閾値判定し、
/// 不可視の点はゼロのまま残す（スロットは維持される）。
pub fn extract_keypoints(
    output: &ArrayViewD<f32>,
    num_keypoints: usize,
    x_factor: f32,
    y_factor: f32,
    offset_x: f32,
    offset_y: f32,
) -> Vec<Keypoint> {
    let keypoints = vec![Keypoint::default(); num_keypoints];

    let shape = output.shape();
    if shape.len() != 3 || shape[1] < 5 + 3 * num_keypoints {
        return keypoints;
    }
    let num_proposals = shape[2];
    if num_proposals == 0 {
        return keypoints;
    }

    let mut best_idx = 0usize;
    let mut max_conf = f32::MIN;
    for i in 0..num_proposals {
        let conf = output[[0, 4, i]];
        if conf > max_conf {
            max_conf = conf;
            best_idx = i;
        }
    }

    if max_conf < PROPOSAL_THRESHOLD {
        return keypoints;
    }

    let mut keypoints = keypoints;
    for (k, slot) in keypoints.iter_mut().enumerate() {
        let x = output[[0, 5 + 3 * k, best_idx]];
        let y = output[[0, 6 + 3 * k, best_idx]];
        let visibility = sigmoid(output[[0, 7 + 3 * k, best_idx]]);

        if visibility > VISIBILITY_THRESHOLD {
            *slot = Keypoint::new(x * x_factor + offset_x, y * y_factor + offset_y, visibility);
        }
    }
    keypoints
}

/// ポーズモデルを1クロップに対して実行し、クロップ座標のキーポイントを返す
pub(crate) fn run_landmark_model(
    session: &mut Session,
    frame: &Mat,
    num_keypoints: usize,
    offset_x: f32,
    offset_y: f32,
) -> Result<Vec<Keypoint>> {
    let x_factor = frame.cols() as f32 / POSE_INPUT_SIZE as f32;
    let y_factor = frame.rows() as f32 / POSE_INPUT_SIZE as f32;

    let input = to_nchw_tensor(frame, POSE_INPUT_SIZE)?;
    let input_tensor = Tensor::from_array(input)?;
    let outputs = session
        .run(ort::inputs!["images" => input_tensor])
        .context("Landmark inference failed")?;

    let output: ArrayViewD<f32> = outputs["output0"]
        .try_extract_array()
        .context("Failed to extract landmark output")?;

    Ok(extract_keypoints(
        &output,
        num_keypoints,
        x_factor,
        y_factor,
        offset_x,
        offset_y,
    ))
}

/// 前腕ベクトルの延長線上に手ROIを推定する
///
/// 中心 = 手首 + 0.6 × 前腕ベクトル、辺長 = 2.5 × 前腕長。
/// クロップ境界でクランプし、退化したROIはNoneを返す。
pub(crate) fn hand_region(
    wrist: &Keypoint,
    elbow: &Keypoint,
    width: i32,
    height: i32,
) -> Option<Rect> {
    let dx = wrist.x - elbow.x;
    let dy = wrist.y - elbow.y;
    let forearm_length = (dx * dx + dy * dy).sqrt();
    if forearm_length <= MIN_FOREARM_LENGTH {
        return None;
    }

    let center_x = wrist.x + dx * 0.6;
    let center_y = wrist.y + dy * 0.6;
    let side = (forearm_length * 2.5) as i32;

    let rect = clamp_rect(
        Rect::new(
            center_x as i32 - side / 2,
            center_y as i32 - side / 2,
            side,
            side,
        ),
        width,
        height,
    );

    if rect.width > MIN_HAND_SIDE && rect.height > MIN_HAND_SIDE {
        Some(rect)
    } else {
        None
    }
}

/// 並進・スケール不変の特徴ベクトルを作る
///
/// ポーズは肩中点を原点、胴体長（肩中点〜腰中点）でスケールを正規化。
/// 各手は手首を原点、手首からの最大距離でスケールを正規化。
/// 正規化後の x, y を [ポーズ17 | 左手21 | 右手21] の順に連結した
/// 118要素を返す。生成されなかったキーポイント集合はゼロ詰めのまま。
pub fn normalize_features(
    pose: &[Keypoint],
    left_hand: &[Keypoint],
    right_hand: &[Keypoint],
) -> Vec<f32> {
    let mut pose = pose.to_vec();
    let mut left_hand = left_hand.to_vec();
    let mut right_hand = right_hand.to_vec();

    if pose.len() == BODY_KEYPOINT_COUNT {
        let mid_x = (pose[LEFT_SHOULDER].x + pose[RIGHT_SHOULDER].x) * 0.5;
        let mid_y = (pose[LEFT_SHOULDER].y + pose[RIGHT_SHOULDER].y) * 0.5;
        let hip_x = (pose[LEFT_HIP].x + pose[RIGHT_HIP].x) * 0.5;
        let hip_y = (pose[LEFT_HIP].y + pose[RIGHT_HIP].y) * 0.5;
        let torso = ((mid_x - hip_x).powi(2) + (mid_y - hip_y).powi(2)).sqrt();

        if torso > 0.01 {
            for kp in pose.iter_mut() {
                if kp.confidence > 0.0 {
                    kp.x = (kp.x - mid_x) / torso;
                    kp.y = (kp.y - mid_y) / torso;
                }
            }
        }
    }

    normalize_hand(&mut left_hand);
    normalize_hand(&mut right_hand);

    let mut features = Vec::with_capacity(FEATURE_LEN);
    for kp in pose.iter().chain(left_hand.iter()).chain(right_hand.iter()) {
        features.push(kp.x);
        features.push(kp.y);
    }
    features
}

/// 手首を原点、手首からの最大距離を1に正規化
fn normalize_hand(hand: &mut [Keypoint]) {
    if hand.len() != HAND_KEYPOINT_COUNT {
        return;
    }
    let wrist = hand[0];
    if (wrist.x * wrist.x + wrist.y * wrist.y).sqrt() <= 0.0 {
        // 手首が原点のままなら手は検出されていない
        return;
    }

    let mut max_dist = 0.0f32;
    for kp in hand.iter() {
        let dx = kp.x - wrist.x;
        let dy = kp.y - wrist.y;
        max_dist = max_dist.max((dx * dx + dy * dy).sqrt());
    }

    for kp in hand.iter_mut() {
        if max_dist > 0.0 {
            kp.x = (kp.x - wrist.x) / max_dist;
            kp.y = (kp.y - wrist.y) / max_dist;
        } else {
            kp.x = 0.0;
            kp.y = 0.0;
        }
    }
}
