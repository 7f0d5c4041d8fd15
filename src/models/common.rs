use std::ops::{Add, Sub};

/// シミュレーション空間内の3次元位置
///
/// 座標系はローカルNED相当（x: 前方, y: 右方, z: 高度）で、
/// 単位は空間ユニット（実機のメートルに対応）です。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position3D {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// XY平面での2次元距離を計算
    pub fn distance_xy(&self, other: &Position3D) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// 3次元距離を計算
    pub fn distance_3d(&self, other: &Position3D) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2))
            .sqrt()
    }
}

impl Add for Position3D {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Sub for Position3D {
    type Output = Self;

    fn sub(self, other: Self) -> Self::Output {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

/// 位置と方位の組（最終指令ポーズの重複判定に使用）
///
/// 同一ポーズへの再指令を抑制するための比較キーです。
/// 動作完了後は `sentinel()` にリセットされ、同じ地点への
/// 次回指令が再び受理されるようになります。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, z: f64, yaw: f64) -> Self {
        Self { x, y, z, yaw }
    }

    /// どの実ポーズとも一致しない番兵値
    pub fn sentinel() -> Self {
        Self::new(-1.0, -1.0, -1.0, -1.0)
    }
}

/// RGB色（LEDインジケータ・軌跡・装飾エリアで共用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorRgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl ColorRgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// 数学ユーティリティ関数
pub mod math_utils {
    /// RC操縦入力の機体座標系デルタをワールド座標系へ変換
    ///
    /// `forward`/`side` は機体前後・左右方向の増分、`yaw_deg` は現在方位、
    /// `delta_yaw_deg` は同時に指令された方位増分です。2つの三角関数項の
    /// 角度基準が異なるのは実機プロトコルの挙動に合わせたものです。
    pub fn rc_body_delta(forward: f64, side: f64, yaw_deg: f64, delta_yaw_deg: f64) -> (f64, f64) {
        let side_angle = (360.0 - yaw_deg + delta_yaw_deg).to_radians();
        let forward_angle = (yaw_deg + delta_yaw_deg).to_radians();

        let dx = side * side_angle.sin() + forward * forward_angle.cos();
        let dy = side * side_angle.cos() + forward * forward_angle.sin();
        (dx, dy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_3d() {
        let a = Position3D::new(0.0, 0.0, 0.0);
        let b = Position3D::new(3.0, 4.0, 0.0);
        assert!((a.distance_3d(&b) - 5.0).abs() < 1e-9);
        assert!((a.distance_xy(&b) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_pose_sentinel_differs_from_origin() {
        assert_ne!(Pose::sentinel(), Pose::new(0.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn test_rc_body_delta_north_heading() {
        // 方位0度では前進入力がそのままx軸増分になる
        let (dx, dy) = math_utils::rc_body_delta(0.05, 0.0, 0.0, 0.0);
        assert!((dx - 0.05).abs() < 1e-9);
        assert!(dy.abs() < 1e-9);
    }
}
