use anyhow::{Context, Result};
use ndarray::{Array4, ArrayViewD};
use opencv::{
    core::{Mat, Rect, Size, CV_32FC3},
    imgproc,
    prelude::*,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;

/// 検出モデルの入力解像度
const INPUT_SIZE: i32 = 640;
/// クラススコアの閾値（この値ちょうどは不採用）
const SCORE_THRESHOLD: f32 = 0.5;
/// NMS の IoU 閾値
const NMS_THRESHOLD: f32 = 0.45;
/// COCO クラス表での person のインデックス
const PERSON_CLASS_ID: usize = 0;

/// YOLOv8 ベースの人物検出器
///
/// モデルはコンストラクタで読み込む。読み込み失敗は起動時の致命的エラー。
pub struct PersonDetector {
    session: Session,
}

impl PersonDetector {
    /// ONNXモデルを読み込んで初期化
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model_path.as_ref())
            .context("Failed to load person detection ONNX model")?;
        Ok(Self { session })
    }

    /// フレームから人物を検出し、フレーム座標のBBox群を返す
    ///
    /// 結果は0個以上、NMS後の順序は未定義。
    pub fn detect(&mut self, frame: &Mat) -> Result<Vec<Rect>> {
        let frame_w = frame.cols();
        let frame_h = frame.rows();

        let input = to_nchw_tensor(frame, INPUT_SIZE)?;
        let input_tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs!["images" => input_tensor])
            .context("Person detection inference failed")?;

        // 出力: [1, 4 + num_classes, N]
        let output: ArrayViewD<f32> = outputs["output0"]
            .try_extract_array()
            .context("Failed to extract person detection output")?;

        let scale_x = frame_w as f32 / INPUT_SIZE as f32;
        let scale_y = frame_h as f32 / INPUT_SIZE as f32;

        let candidates = decode_proposals(&output, SCORE_THRESHOLD, scale_x, scale_y);
        let kept = nms(&candidates, NMS_THRESHOLD);
        Ok(kept.into_iter().map(|(rect, _)| rect).collect())
    }
}

/// 提案テンソルをBBox候補に復号する
///
/// 各提案について全クラスの最大スコアを取り、閾値を超え（排他的下限）かつ
/// argmax が person のものだけを center-size → corner に変換して採用する。
/// 座標は scale_x/scale_y で元フレームサイズへ戻す。
pub fn decode_proposals(
    output: &ArrayViewD<f32>,
    score_threshold: f32,
    scale_x: f32,
    scale_y: f32,
) -> Vec<(Rect, f32)> {
    let shape = output.shape();
    if shape.len() != 3 || shape[1] < 5 {
        return Vec::new();
    }
    let num_classes = shape[1] - 4;
    let num_proposals = shape[2];

    let mut detections = Vec::new();
    for i in 0..num_proposals {
        let mut best_score = f32::MIN;
        let mut best_class = 0usize;
        for class in 0..num_classes {
            let score = output[[0, 4 + class, i]];
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }

        if best_score > score_threshold && best_class == PERSON_CLASS_ID {
            let cx = output[[0, 0, i]];
            let cy = output[[0, 1, i]];
            let w = output[[0, 2, i]];
            let h = output[[0, 3, i]];

            let rect = Rect::new(
                ((cx - 0.5 * w) * scale_x) as i32,
                ((cy - 0.5 * h) * scale_y) as i32,
                (w * scale_x) as i32,
                (h * scale_y) as i32,
            );
            detections.push((rect, best_score));
        }
    }
    detections
}

/// 貪欲法の Non-Maximum Suppression
///
/// スコア降順に走査し、採用済みBBoxとの IoU が閾値を超えるものを捨てる。
/// 既に抑制済みの集合に対しては冪等。
pub fn nms(detections: &[(Rect, f32)], iou_threshold: f32) -> Vec<(Rect, f32)> {
    let mut sorted: Vec<(Rect, f32)> = detections.to_vec();
    sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut kept: Vec<(Rect, f32)> = Vec::new();
    for (rect, score) in sorted {
        let suppressed = kept
            .iter()
            .any(|(kept_rect, _)| iou(&rect, kept_rect) > iou_threshold);
        if !suppressed {
            kept.push((rect, score));
        }
    }
    kept
}

/// BBoxをフレーム境界と交差させる
///
/// 検出結果はフレーム外にはみ出すことがあるため、クロップ前に必ず通すこと。
/// 交差が空のときは幅・高さ0のRectになる。
pub fn clamp_rect(rect: Rect, width: i32, height: i32) -> Rect {
    let x1 = rect.x.clamp(0, width);
    let y1 = rect.y.clamp(0, height);
    let x2 = (rect.x + rect.width).clamp(0, width);
    let y2 = (rect.y + rect.height).clamp(0, height);
    Rect::new(x1, y1, (x2 - x1).max(0), (y2 - y1).max(0))
}

fn iou(a: &Rect, b: &Rect) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = ((x2 - x1).max(0) * (y2 - y1).max(0)) as f32;
    let union = (a.width * a.height + b.width * b.height) as f32 - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

/// BGR Mat → NCHW [1, 3, size, size] テンソルに変換（RGB化・[0,1]正規化込み）
pub(crate) fn to_nchw_tensor(frame: &Mat, size: i32) -> Result<Array4<f32>> {
    // BGR -> RGB
    let mut rgb = Mat::default();
    imgproc::cvt_color_def(frame, &mut rgb, imgproc::COLOR_BGR2RGB)?;

    // size x size にリサイズ
    let mut resized = Mat::default();
    imgproc::resize(
        &rgb,
        &mut resized,
        Size::new(size, size),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;

    // f32 に変換
    let mut float_mat = Mat::default();
    resized.convert_to(&mut float_mat, CV_32FC3, 1.0, 0.0)?;

    // [0, 255] → [0.0, 1.0] 正規化 & NCHW変換
    let s = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, s, s));
    let data = float_mat.data_bytes()?;
    let step = float_mat.mat_step().get(0);
    for y in 0..s {
        let row_ptr = unsafe {
            std::slice::from_raw_parts(data.as_ptr().add(y * step) as *const f32, s * 3)
        };
        for x in 0..s {
            for c in 0..3 {
                tensor[[0, c, y, x]] = row_ptr[x * 3 + c] / 255.0;
            }
        }
    }

    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    /// [1, 84, n] の提案テンソルを作る
    fn proposals(entries: &[(f32, f32, f32, f32, usize, f32)]) -> Array3<f32> {
        let mut output = Array3::<f32>::zeros((1, 84, entries.len()));
        for (i, &(cx, cy, w, h, class, score)) in entries.iter().enumerate() {
            output[[0, 0, i]] = cx;
            output[[0, 1, i]] = cy;
            output[[0, 2, i]] = w;
            output[[0, 3, i]] = h;
            output[[0, 4 + class, i]] = score;
        }
        output
    }

    #[test]
    fn test_score_exactly_at_threshold_is_excluded() {
        let output = proposals(&[(100.0, 100.0, 50.0, 80.0, 0, 0.5)]);
        let view = output.view().into_dyn();
        let detections = decode_proposals(&view, 0.5, 1.0, 1.0);
        assert!(detections.is_empty());
    }

    #[test]
    fn test_score_above_threshold_is_retained() {
        let output = proposals(&[(100.0, 100.0, 50.0, 80.0, 0, 0.51)]);
        let view = output.view().into_dyn();
        let detections = decode_proposals(&view, 0.5, 1.0, 1.0);
        assert_eq!(detections.len(), 1);

        // center-size → corner
        let (rect, score) = detections[0];
        assert_eq!(rect, Rect::new(75, 60, 50, 80));
        assert!((score - 0.51).abs() < 1e-6);
    }

    #[test]
    fn test_non_person_argmax_is_excluded() {
        // person スコアが高くても argmax が別クラスなら不採用
        let mut output = proposals(&[(100.0, 100.0, 50.0, 80.0, 0, 0.6)]);
        output[[0, 4 + 2, 0]] = 0.9;
        let view = output.view().into_dyn();
        let detections = decode_proposals(&view, 0.5, 1.0, 1.0);
        assert!(detections.is_empty());
    }

    #[test]
    fn test_empty_proposal_tensor() {
        let output = Array3::<f32>::zeros((1, 84, 0));
        let view = output.view().into_dyn();
        assert!(decode_proposals(&view, 0.5, 1.0, 1.0).is_empty());
    }

    #[test]
    fn test_scaling_back_to_frame() {
        // 640x640 入力 → 1280x480 フレーム
        let output = proposals(&[(320.0, 320.0, 100.0, 200.0, 0, 0.9)]);
        let view = output.view().into_dyn();
        let detections = decode_proposals(&view, 0.5, 2.0, 0.75);
        assert_eq!(detections[0].0, Rect::new(540, 165, 200, 150));
    }

    #[test]
    fn test_nms_suppresses_duplicates() {
        let detections = vec![
            (Rect::new(100, 100, 50, 50), 0.9),
            (Rect::new(102, 101, 50, 50), 0.8), // ほぼ同じ位置
            (Rect::new(300, 300, 40, 40), 0.7),
        ];
        let kept = nms(&detections, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].0, Rect::new(100, 100, 50, 50));
        assert_eq!(kept[1].0, Rect::new(300, 300, 40, 40));
    }

    #[test]
    fn test_nms_idempotent() {
        let detections = vec![
            (Rect::new(100, 100, 50, 50), 0.9),
            (Rect::new(105, 105, 50, 50), 0.8),
            (Rect::new(300, 300, 40, 40), 0.7),
            (Rect::new(10, 10, 20, 20), 0.6),
        ];
        let once = nms(&detections, 0.45);
        let twice = nms(&once, 0.45);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_iou_disjoint_is_zero() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(20, 20, 10, 10);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_clamp_rect() {
        // はみ出しは境界で切り詰める
        let clamped = clamp_rect(Rect::new(-10, 5, 50, 100), 100, 60);
        assert_eq!(clamped, Rect::new(0, 5, 40, 55));

        // 完全にフレーム外なら空になる
        let outside = clamp_rect(Rect::new(200, 200, 30, 30), 100, 100);
        assert_eq!(outside.width, 0);
        assert_eq!(outside.height, 0);
    }
}
