use anyhow::Result;
use opencv::{
    core::{self, Mat, Point, Scalar, Size, Vec3f, Vector, CV_32F, CV_32FC3, CV_8UC3},
    imgproc,
    prelude::*,
};

/// ダークチャネル推定のパッチサイズ（正方形構造要素の辺長）
const PATCH_SIZE: i32 = 15;
/// 霞除去の強さ
const OMEGA: f32 = 0.1;
/// 透過率の下限（過増幅防止）
const T_MIN: f32 = 0.1;
/// ガイデッドフィルタの正則化項
const GUIDED_EPS: f64 = 1e-3;
/// CLAHE のクリップリミット
const CLAHE_CLIP: f64 = 3.0;

/// 霞除去 + 局所コントラスト補正
///
/// 入力はBGR 8bitフレーム。同一パラメータなら決定的で、共有状態を持たない。
/// 全域ゼロのような退化した入力でも例外は出さず退化した出力を返す。
pub fn enhance(frame: &Mat) -> Result<Mat> {
    // [0,1] の浮動小数点に正規化
    let mut image = Mat::default();
    frame.convert_to(&mut image, CV_32FC3, 1.0 / 255.0, 0.0)?;

    let dark = dark_channel(&image)?;
    let airlight = atmospheric_light(&image, &dark)?;

    let mut transmission = transmission_estimate(&image, airlight)?;

    // グレースケールをガイドにエッジを保ちながら透過率マップを平滑化
    let guide = gray_guide(frame)?;
    transmission = guided_filter(&guide, &transmission, PATCH_SIZE, GUIDED_EPS)?;

    let radiance = recover_radiance(&image, airlight, &transmission)?;
    clahe_on_lightness(&radiance)
}

/// ダークチャネル: 3チャネルの画素毎最小値をパッチ侵食したもの
fn dark_channel(image: &Mat) -> Result<Mat> {
    let mut channels: Vector<Mat> = Vector::new();
    core::split(image, &mut channels)?;
    let minimum = channel_min(&channels)?;
    erode_patch(&minimum)
}

/// 3チャネルの画素毎最小値
fn channel_min(channels: &Vector<Mat>) -> Result<Mat> {
    let mut pair = Mat::default();
    core::min(&channels.get(0)?, &channels.get(1)?, &mut pair)?;
    let mut minimum = Mat::default();
    core::min(&pair, &channels.get(2)?, &mut minimum)?;
    Ok(minimum)
}

/// パッチサイズの正方形構造要素で侵食（局所最小の近似）
fn erode_patch(src: &Mat) -> Result<Mat> {
    let kernel = imgproc::get_structuring_element_def(
        imgproc::MORPH_RECT,
        Size::new(PATCH_SIZE, PATCH_SIZE),
    )?;
    let mut eroded = Mat::default();
    imgproc::erode_def(src, &mut eroded, &kernel)?;
    Ok(eroded)
}

/// 大気光の推定: ダークチャネルの最大点における画素色
fn atmospheric_light(image: &Mat, dark: &Mat) -> Result<Vec3f> {
    let mut max_loc = Point::default();
    core::min_max_loc(
        dark,
        None,
        None,
        None,
        Some(&mut max_loc),
        &core::no_array(),
    )?;
    Ok(*image.at_2d::<Vec3f>(max_loc.y, max_loc.x)?)
}

/// 透過率の推定: t = 1 - omega * min_c( erode(I_c / A_c) )
fn transmission_estimate(image: &Mat, airlight: Vec3f) -> Result<Mat> {
    let mut channels: Vector<Mat> = Vector::new();
    core::split(image, &mut channels)?;

    let mut normalized: Vector<Mat> = Vector::new();
    for c in 0..3 {
        // A成分がゼロでも破綻しないよう下駄を履かせる
        let scale = 1.0 / f64::from(airlight[c]).max(1e-6);
        let mut norm_c = Mat::default();
        channels.get(c)?.convert_to(&mut norm_c, -1, scale, 0.0)?;
        normalized.push(norm_c);
    }

    let minimum = channel_min(&normalized)?;
    let eroded = erode_patch(&minimum)?;

    let mut transmission = Mat::default();
    eroded.convert_to(&mut transmission, -1, -f64::from(OMEGA), 1.0)?;
    Ok(transmission)
}

/// 原フレームのグレースケールを [0,1] f32 で返す（ガイド画像用）
fn gray_guide(frame: &Mat) -> Result<Mat> {
    let mut gray = Mat::default();
    imgproc::cvt_color_def(frame, &mut gray, imgproc::COLOR_BGR2GRAY)?;
    let mut gray_f = Mat::default();
    gray.convert_to(&mut gray_f, CV_32F, 1.0 / 255.0, 0.0)?;
    Ok(gray_f)
}

/// ガイデッドフィルタ (He et al.) のボックスフィルタ定式化
///
/// q = mean(a) * guide + mean(b),
/// a = cov(guide, src) / (var(guide) + eps), b = mean(src) - a * mean(guide)
fn guided_filter(guide: &Mat, src: &Mat, radius: i32, eps: f64) -> Result<Mat> {
    let ksize = Size::new(radius, radius);

    let box_mean = |m: &Mat| -> Result<Mat> {
        let mut mean = Mat::default();
        imgproc::box_filter_def(m, &mut mean, -1, ksize)?;
        Ok(mean)
    };

    let mean_guide = box_mean(guide)?;
    let mean_src = box_mean(src)?;

    let mut guide_sq = Mat::default();
    core::multiply_def(guide, guide, &mut guide_sq)?;
    let mut guide_src = Mat::default();
    core::multiply_def(guide, src, &mut guide_src)?;

    let corr_guide = box_mean(&guide_sq)?;
    let corr_cross = box_mean(&guide_src)?;

    // var = E[g^2] - E[g]^2, cov = E[g*s] - E[g]E[s]
    let mut mean_guide_sq = Mat::default();
    core::multiply_def(&mean_guide, &mean_guide, &mut mean_guide_sq)?;
    let mut var_guide = Mat::default();
    core::subtract_def(&corr_guide, &mean_guide_sq, &mut var_guide)?;

    let mut mean_cross = Mat::default();
    core::multiply_def(&mean_guide, &mean_src, &mut mean_cross)?;
    let mut cov = Mat::default();
    core::subtract_def(&corr_cross, &mean_cross, &mut cov)?;

    let mut var_eps = Mat::default();
    var_guide.convert_to(&mut var_eps, -1, 1.0, eps)?;

    let mut a = Mat::default();
    core::divide2_def(&cov, &var_eps, &mut a)?;
    let mut a_mean_guide = Mat::default();
    core::multiply_def(&a, &mean_guide, &mut a_mean_guide)?;
    let mut b = Mat::default();
    core::subtract_def(&mean_src, &a_mean_guide, &mut b)?;

    let mean_a = box_mean(&a)?;
    let mean_b = box_mean(&b)?;

    let mut scaled = Mat::default();
    core::multiply_def(&mean_a, guide, &mut scaled)?;
    let mut filtered = Mat::default();
    core::add_def(&scaled, &mean_b, &mut filtered)?;
    Ok(filtered)
}

/// 輝度復元: J = (I - A) / max(t, t_min) + A、8bitに戻して返す
fn recover_radiance(image: &Mat, airlight: Vec3f, transmission: &Mat) -> Result<Mat> {
    let floor = Mat::new_rows_cols_with_default(
        transmission.rows(),
        transmission.cols(),
        CV_32F,
        Scalar::all(f64::from(T_MIN)),
    )?;
    let mut t_floored = Mat::default();
    core::max(transmission, &floor, &mut t_floored)?;

    let mut channels: Vector<Mat> = Vector::new();
    core::split(image, &mut channels)?;

    let mut recovered: Vector<Mat> = Vector::new();
    for c in 0..3 {
        let a_c = f64::from(airlight[c]);
        let mut shifted = Mat::default();
        channels.get(c)?.convert_to(&mut shifted, -1, 1.0, -a_c)?;
        let mut quotient = Mat::default();
        core::divide2_def(&shifted, &t_floored, &mut quotient)?;
        let mut radiance_c = Mat::default();
        quotient.convert_to(&mut radiance_c, -1, 1.0, a_c)?;
        recovered.push(radiance_c);
    }

    let mut merged = Mat::default();
    core::merge(&recovered, &mut merged)?;
    let mut output = Mat::default();
    merged.convert_to(&mut output, CV_8UC3, 255.0, 0.0)?;
    Ok(output)
}

/// Lab空間のLチャネルにのみCLAHEを適用（色バランスを崩さない）
fn clahe_on_lightness(bgr: &Mat) -> Result<Mat> {
    let mut lab = Mat::default();
    imgproc::cvt_color_def(bgr, &mut lab, imgproc::COLOR_BGR2Lab)?;

    let mut lab_channels: Vector<Mat> = Vector::new();
    core::split(&lab, &mut lab_channels)?;

    let mut clahe = imgproc::create_clahe(CLAHE_CLIP, Size::new(8, 8))?;
    let mut lightness = Mat::default();
    clahe.apply(&lab_channels.get(0)?, &mut lightness)?;
    lab_channels.set(0, lightness)?;

    let mut merged = Mat::default();
    core::merge(&lab_channels, &mut merged)?;
    let mut output = Mat::default();
    imgproc::cvt_color_def(&merged, &mut output, imgproc::COLOR_Lab2BGR)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_frame(value: f64, rows: i32, cols: i32) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::all(value)).unwrap()
    }

    #[test]
    fn test_enhance_preserves_uniform_brightness() {
        // 霞のない一様なグレーは平均輝度がほぼ保たれる
        let frame = uniform_frame(128.0, 64, 64);
        let enhanced = enhance(&frame).unwrap();

        assert_eq!(enhanced.rows(), 64);
        assert_eq!(enhanced.cols(), 64);
        assert_eq!(enhanced.typ(), CV_8UC3);

        let mean_in = core::mean_def(&frame).unwrap();
        let mean_out = core::mean_def(&enhanced).unwrap();
        for c in 0..3 {
            assert!(
                (mean_in[c] - mean_out[c]).abs() < 10.0,
                "channel {} drifted: {} -> {}",
                c,
                mean_in[c],
                mean_out[c]
            );
        }
    }

    #[test]
    fn test_transmission_near_one_without_haze() {
        // 一様画像では min(I/A) = 1 なので t = 1 - omega
        let frame = uniform_frame(128.0, 64, 64);
        let mut image = Mat::default();
        frame.convert_to(&mut image, CV_32FC3, 1.0 / 255.0, 0.0).unwrap();

        let dark = dark_channel(&image).unwrap();
        let airlight = atmospheric_light(&image, &dark).unwrap();
        let transmission = transmission_estimate(&image, airlight).unwrap();

        let mean_t = core::mean_def(&transmission).unwrap()[0];
        assert!(
            (mean_t - (1.0 - f64::from(OMEGA))).abs() < 0.02,
            "mean transmission = {mean_t}"
        );
    }

    #[test]
    fn test_enhance_degenerate_black_frame() {
        // 全域ゼロでもエラーにはならない
        let frame = uniform_frame(0.0, 32, 32);
        let enhanced = enhance(&frame).unwrap();
        assert_eq!(enhanced.rows(), 32);
        assert_eq!(enhanced.cols(), 32);
    }

    #[test]
    fn test_guided_filter_smooths_toward_guide_mean() {
        // 一様なガイド・一様な入力なら出力も一様のまま
        let guide = Mat::new_rows_cols_with_default(32, 32, CV_32F, Scalar::all(0.5)).unwrap();
        let src = Mat::new_rows_cols_with_default(32, 32, CV_32F, Scalar::all(0.9)).unwrap();
        let out = guided_filter(&guide, &src, PATCH_SIZE, GUIDED_EPS).unwrap();
        let mean = core::mean_def(&out).unwrap()[0];
        assert!((mean - 0.9).abs() < 1e-3, "mean = {mean}");
    }
}
