//! オブジェクト種別・フィールドレコード・ハンドラ契約の定義
//!
//! すべてのシミュレーションオブジェクト（ドローン・熱源・装飾エリア）は
//! `ModelHandler` を実装するハンドラを通じて生成・更新・削除・起動・停止
//! されます。ハンドラは `ObjectKind` をキーとして静的に登録され、
//! 種別判定のための動的検査は行いません。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::area::AreaModel;
use crate::models::common::{ColorRgb, Position3D};
use crate::models::endpoint::DroneEndpoint;
use crate::models::heat_source::HeatSourceModel;
use crate::scenario::SimulationSettings;

/// オブジェクト種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Drone,
    HeatSource,
    Area,
}

impl ObjectKind {
    /// 永続化レコード・ログで使用する種別名
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Drone => "drone",
            ObjectKind::HeatSource => "heat_source",
            ObjectKind::Area => "area",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drone" => Ok(ObjectKind::Drone),
            "heat_source" => Ok(ObjectKind::HeatSource),
            "area" => Ok(ObjectKind::Area),
            _ => Err(format!("未知のオブジェクト種別: {}", s)),
        }
    }
}

/// 永続化用の2次元座標レコード
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Vec2Record {
    pub x: f64,
    pub y: f64,
}

/// 永続化用の3次元座標レコード
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Vec3Record {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<Vec3Record> for Position3D {
    fn from(v: Vec3Record) -> Self {
        Position3D::new(v.x, v.y, v.z)
    }
}

/// 永続化用のRGBレコード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RgbRecord {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl From<RgbRecord> for ColorRgb {
    fn from(v: RgbRecord) -> Self {
        ColorRgb::new(v.r, v.g, v.b)
    }
}

/// ドローンの設定フィールド
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DroneFields {
    pub hostname: String,
    pub port: u16,
    pub start_position: Vec3Record,
    pub trajectory_color: RgbRecord,
}

/// 熱源の設定フィールド（温度・半径はシミュレーション設定から供給）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatSourceFields {
    pub position: Vec2Record,
}

/// 装飾エリアの設定フィールド
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaFields {
    pub position: Vec2Record,
    pub scale: Vec3Record,
    pub color: RgbRecord,
}

/// 種別ごとの設定フィールド
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectFields {
    Drone(DroneFields),
    HeatSource(HeatSourceFields),
    Area(AreaFields),
}

impl ObjectFields {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectFields::Drone(_) => ObjectKind::Drone,
            ObjectFields::HeatSource(_) => ObjectKind::HeatSource,
            ObjectFields::Area(_) => ObjectKind::Area,
        }
    }

    pub fn as_drone(&self) -> Result<&DroneFields, ModelError> {
        match self {
            ObjectFields::Drone(f) => Ok(f),
            other => Err(ModelError::kind_mismatch(ObjectKind::Drone, other.kind())),
        }
    }

    pub fn as_heat_source(&self) -> Result<&HeatSourceFields, ModelError> {
        match self {
            ObjectFields::HeatSource(f) => Ok(f),
            other => Err(ModelError::kind_mismatch(ObjectKind::HeatSource, other.kind())),
        }
    }

    pub fn as_area(&self) -> Result<&AreaFields, ModelError> {
        match self {
            ObjectFields::Area(f) => Ok(f),
            other => Err(ModelError::kind_mismatch(ObjectKind::Area, other.kind())),
        }
    }
}

/// 稼働中オブジェクトのインスタンス
///
/// 熱源・エリアはライフサイクルマネージャのみが更新し、エージェント側は
/// 読み取り専用でアクセスします。
pub enum ObjectInstance {
    Drone(Arc<DroneEndpoint>),
    HeatSource(Arc<Mutex<HeatSourceModel>>),
    Area(Arc<Mutex<AreaModel>>),
}

impl ObjectInstance {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectInstance::Drone(_) => ObjectKind::Drone,
            ObjectInstance::HeatSource(_) => ObjectKind::HeatSource,
            ObjectInstance::Area(_) => ObjectKind::Area,
        }
    }
}

/// モデル状態の変更通知
///
/// 可視化がエージェントの動きを知る唯一の経路です。各状態変更の直後に
/// シミュレーションコアが所有するチャンネルへ送信されます。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelEvent {
    PositionChanged {
        object_id: u32,
        position: Position3D,
        yaw: f64,
    },
    ColorChanged {
        object_id: u32,
        color: ColorRgb,
    },
}

/// 可視化シンクの契約（外部コラボレータ）
///
/// シミュレーションコアは位置・色・スケールの変更通知を流すだけで、
/// 描画そのものには関与しません。
pub trait VisualizationSink: Send + Sync {
    fn add_model(
        &self,
        kind: ObjectKind,
        position: Position3D,
        heading: f64,
        has_trajectory: bool,
        color: ColorRgb,
    );
    fn change_model_position(&self, index: usize, position: Position3D, yaw: f64);
    fn change_model_color(&self, index: usize, color: ColorRgb);
    fn change_model_scale(&self, index: usize, scale: Position3D);
    fn remove_model(&self, index: usize);
    fn get_model_color(&self, index: usize) -> ColorRgb;
    fn get_model_position(&self, index: usize) -> Position3D;
}

/// ハンドラ操作に渡されるワールド側のコンテキスト
pub struct WorldContext<'a> {
    /// 生成されるオブジェクトの安定ID（イベント送信元の識別に使用）
    pub object_id: u32,
    /// オブジェクトリスト内のインデックス（可視化呼び出しに使用）
    pub index: usize,
    /// 同一種別の既存インスタンス数
    pub kind_count: usize,
    pub settings: &'a SimulationSettings,
    pub events: mpsc::UnboundedSender<ModelEvent>,
    pub viz: &'a dyn VisualizationSink,
}

/// 全オブジェクト種別が実装する統一インターフェース
///
/// ライフサイクルマネージャは常に種別キーでハンドラを引き、
/// 直接の型検査によるディスパッチは行いません。
pub trait ModelHandler: Send + Sync {
    /// このハンドラが扱う種別
    fn kind(&self) -> ObjectKind;

    /// 既定の設定フィールド
    fn default_fields(&self) -> ObjectFields;

    /// 生成前の妥当性チェック
    fn check_fields(&self, fields: &ObjectFields) -> bool;

    /// 人間可読の説明文
    fn describe(&self, fields: &ObjectFields) -> String;

    /// ステータスパネルへ寄与するかどうか
    fn reports_status(&self) -> bool;

    /// 永続化レコードへの変換
    fn pack(&self, fields: &ObjectFields) -> Result<serde_yaml::Value, ModelError>;

    /// 永続化レコードからの復元（欠損フィールドは既定値で補完）
    fn unpack(&self, record: &serde_yaml::Value) -> Result<ObjectFields, ModelError>;

    /// インスタンスの生成（可視化への登録を含む）
    fn create(
        &self,
        fields: &ObjectFields,
        ctx: &WorldContext<'_>,
    ) -> Result<ObjectInstance, ModelError>;

    /// 既存インスタンスの設定更新
    fn update(
        &self,
        instance: &mut ObjectInstance,
        index: usize,
        fields: &ObjectFields,
        viz: &dyn VisualizationSink,
    ) -> Result<(), ModelError>;

    /// インスタンスの削除（既定では停止と同じ）
    fn remove(&self, instance: &ObjectInstance) {
        self.close(instance);
    }

    /// 稼働開始（ネットワークエンドポイント・バックグラウンドループの起動）
    fn start(&self, instance: &ObjectInstance, ctx: &WorldContext<'_>) -> Result<(), ModelError>;

    /// 稼働停止
    fn close(&self, instance: &ObjectInstance);

    /// ステータスの取得
    fn status(&self, instance: &ObjectInstance) -> BTreeMap<String, String>;
}

/// モデル操作のエラー
#[derive(Debug)]
pub enum ModelError {
    /// ハンドラ種別と渡されたフィールド/インスタンス種別の不一致
    KindMismatch {
        expected: ObjectKind,
        found: ObjectKind,
    },
    /// 生成前チェックに失敗したフィールド
    InvalidFields(String),
    /// 永続化レコードの変換失敗
    InvalidRecord(serde_yaml::Error),
}

impl ModelError {
    pub fn kind_mismatch(expected: ObjectKind, found: ObjectKind) -> Self {
        ModelError::KindMismatch { expected, found }
    }
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::KindMismatch { expected, found } => {
                write!(f, "種別不一致: {} を期待しましたが {} でした", expected, found)
            }
            ModelError::InvalidFields(msg) => write!(f, "不正なフィールド: {}", msg),
            ModelError::InvalidRecord(e) => write!(f, "レコード変換エラー: {}", e),
        }
    }
}

impl std::error::Error for ModelError {}
