//! 熱源モデル
//!
//! 2次元位置の温度値を決める純粋な温度場です。ドローンは位置が変わる
//! たびに全熱源をサンプリングし、最大値を仮想温度センサーの読みとして
//! 保持します。減衰モードでは距離に応じた線形補間、静的モードでは
//! 半径内一律の最高温度を返します。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::models::common::Position3D;
use crate::models::traits::{
    HeatSourceFields, ModelError, ModelHandler, ObjectFields, ObjectInstance, ObjectKind,
    VisualizationSink, WorldContext,
};
use crate::models::common::ColorRgb;

/// 熱源マーカーの表示色
const MARKER_COLOR: ColorRgb = ColorRgb { r: 200, g: 44, b: 31 };

/// 熱源1基の状態
#[derive(Debug, Clone, PartialEq)]
pub struct HeatSourceModel {
    /// ドローンの温度読み配列に対応する連番ID
    pub id: usize,
    pub x: f64,
    pub y: f64,
    min_temp: f64,
    max_temp: f64,
    radius: f64,
}

impl HeatSourceModel {
    pub fn new(id: usize, x: f64, y: f64, min_temp: f64, max_temp: f64, radius: f64) -> Self {
        Self {
            id,
            x,
            y,
            min_temp,
            max_temp,
            radius,
        }
    }

    pub fn set_position(&mut self, x: f64, y: f64) {
        self.x = x;
        self.y = y;
    }

    /// 指定位置の温度を計算
    ///
    /// 半径外では最低温度。半径内では静的モードなら最高温度そのまま、
    /// 減衰モードなら `min + (1 - d/radius) * (max - min)` の線形補間。
    pub fn temperature_at(&self, x: f64, y: f64, static_falloff: bool) -> f64 {
        let distance = ((x - self.x).powi(2) + (y - self.y).powi(2)).sqrt();

        if distance >= self.radius {
            self.min_temp
        } else if static_falloff {
            self.max_temp
        } else {
            let k = 1.0 - distance / self.radius;
            self.min_temp + k * (self.max_temp - self.min_temp)
        }
    }

    pub fn status(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("min_temp".to_string(), format!("{:.1}", self.min_temp));
        map.insert("max_temp".to_string(), format!("{:.1}", self.max_temp));
        map
    }
}

/// 熱源のライフサイクルハンドラ
pub struct HeatSourceHandler;

impl ModelHandler for HeatSourceHandler {
    fn kind(&self) -> ObjectKind {
        ObjectKind::HeatSource
    }

    fn default_fields(&self) -> ObjectFields {
        ObjectFields::HeatSource(HeatSourceFields::default())
    }

    fn check_fields(&self, fields: &ObjectFields) -> bool {
        fields.as_heat_source().is_ok()
    }

    fn describe(&self, fields: &ObjectFields) -> String {
        match fields.as_heat_source() {
            Ok(f) => format!("位置: ({:.1}, {:.1})", f.position.x, f.position.y),
            Err(_) => String::new(),
        }
    }

    fn reports_status(&self) -> bool {
        false
    }

    fn pack(&self, fields: &ObjectFields) -> Result<serde_yaml::Value, ModelError> {
        serde_yaml::to_value(fields.as_heat_source()?).map_err(ModelError::InvalidRecord)
    }

    fn unpack(&self, record: &serde_yaml::Value) -> Result<ObjectFields, ModelError> {
        let fields: HeatSourceFields =
            serde_yaml::from_value(record.clone()).map_err(ModelError::InvalidRecord)?;
        Ok(ObjectFields::HeatSource(fields))
    }

    fn create(
        &self,
        fields: &ObjectFields,
        ctx: &WorldContext<'_>,
    ) -> Result<ObjectInstance, ModelError> {
        let f = fields.as_heat_source()?;
        let settings = &ctx.settings.heat_source;
        let model = HeatSourceModel::new(
            ctx.kind_count,
            f.position.x,
            f.position.y,
            settings.min_temp,
            settings.max_temp,
            settings.radius,
        );
        ctx.viz.add_model(
            ObjectKind::HeatSource,
            Position3D::new(f.position.x, f.position.y, 0.0),
            0.0,
            false,
            MARKER_COLOR,
        );
        Ok(ObjectInstance::HeatSource(Arc::new(Mutex::new(model))))
    }

    fn update(
        &self,
        instance: &mut ObjectInstance,
        index: usize,
        fields: &ObjectFields,
        viz: &dyn VisualizationSink,
    ) -> Result<(), ModelError> {
        let f = fields.as_heat_source()?;
        let ObjectInstance::HeatSource(model) = instance else {
            return Err(ModelError::kind_mismatch(
                ObjectKind::HeatSource,
                instance.kind(),
            ));
        };
        model.lock().unwrap().set_position(f.position.x, f.position.y);
        viz.change_model_position(index, Position3D::new(f.position.x, f.position.y, 0.0), 0.0);
        Ok(())
    }

    fn start(&self, _instance: &ObjectInstance, _ctx: &WorldContext<'_>) -> Result<(), ModelError> {
        // 熱源はバックグラウンド実行を持たない
        Ok(())
    }

    fn close(&self, _instance: &ObjectInstance) {}

    fn status(&self, instance: &ObjectInstance) -> BTreeMap<String, String> {
        match instance {
            ObjectInstance::HeatSource(model) => model.lock().unwrap().status(),
            _ => BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_falloff_is_step_function() {
        let source = HeatSourceModel::new(0, 0.0, 0.0, 20.0, 60.0, 0.5);
        // 半径内は最高温度そのまま
        assert_eq!(source.temperature_at(0.4, 0.0, true), 60.0);
        // 半径外は最低温度
        assert_eq!(source.temperature_at(0.6, 0.0, true), 20.0);
        // 境界ちょうども半径外扱い
        assert_eq!(source.temperature_at(0.5, 0.0, true), 20.0);
    }

    #[test]
    fn test_decaying_falloff_interpolates() {
        let source = HeatSourceModel::new(0, 0.0, 0.0, 20.0, 60.0, 0.5);
        // 半径の中間地点では中間温度
        let temp = source.temperature_at(0.25, 0.0, false);
        assert!((temp - 40.0).abs() < 1e-9);
        // 中心では最高温度
        assert!((source.temperature_at(0.0, 0.0, false) - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_status_exposes_temperatures() {
        let source = HeatSourceModel::new(0, 1.0, 2.0, 20.0, 60.0, 0.5);
        let status = source.status();
        assert_eq!(status.get("min_temp").map(String::as_str), Some("20.0"));
        assert_eq!(status.get("max_temp").map(String::as_str), Some("60.0"));
    }
}
