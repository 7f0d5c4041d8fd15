// 基本的なデータ型と数学ユーティリティ
pub mod common;

// オブジェクト種別・ハンドラ契約の定義
pub mod traits;

// 各オブジェクトモデルの実装
pub mod area;
pub mod battery;
pub mod drone;
pub mod endpoint;
pub mod heat_source;

// 便利な re-export
pub use common::{ColorRgb, Pose, Position3D};
pub use traits::{
    ModelError, ModelEvent, ModelHandler, ObjectFields, ObjectInstance, ObjectKind,
    VisualizationSink, WorldContext,
};
pub use area::{AreaHandler, AreaModel};
pub use battery::BatteryModel;
pub use drone::DroneModel;
pub use endpoint::{DroneEndpoint, DroneHandler};
pub use heat_source::{HeatSourceHandler, HeatSourceModel};
