//! 装飾エリアモデル
//!
//! シミュレーション挙動を持たない静的なジオメトリです。位置・寸法・色を
//! 保持して可視化へ伝えるだけで、ステータス報告は空マップを返します。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::models::common::{ColorRgb, Position3D};
use crate::models::traits::{
    AreaFields, ModelError, ModelHandler, ObjectFields, ObjectInstance, ObjectKind,
    VisualizationSink, WorldContext,
};

/// 装飾エリア1面の状態
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaModel {
    pub x: f64,
    pub y: f64,
    pub scale: Position3D,
    pub color: ColorRgb,
}

impl AreaModel {
    pub fn new(x: f64, y: f64, scale: Position3D, color: ColorRgb) -> Self {
        Self { x, y, scale, color }
    }

    pub fn set_position(&mut self, x: f64, y: f64) {
        self.x = x;
        self.y = y;
    }

    pub fn status(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// 装飾エリアのライフサイクルハンドラ
pub struct AreaHandler;

impl ModelHandler for AreaHandler {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Area
    }

    fn default_fields(&self) -> ObjectFields {
        ObjectFields::Area(AreaFields::default())
    }

    fn check_fields(&self, fields: &ObjectFields) -> bool {
        fields.as_area().is_ok()
    }

    fn describe(&self, fields: &ObjectFields) -> String {
        match fields.as_area() {
            Ok(f) => format!(
                "位置: ({:.1}, {:.1}), 寸法: ({:.1}, {:.1}, {:.1}), 色: ({}, {}, {})",
                f.position.x,
                f.position.y,
                f.scale.x,
                f.scale.y,
                f.scale.z,
                f.color.r,
                f.color.g,
                f.color.b,
            ),
            Err(_) => String::new(),
        }
    }

    fn reports_status(&self) -> bool {
        false
    }

    fn pack(&self, fields: &ObjectFields) -> Result<serde_yaml::Value, ModelError> {
        serde_yaml::to_value(fields.as_area()?).map_err(ModelError::InvalidRecord)
    }

    fn unpack(&self, record: &serde_yaml::Value) -> Result<ObjectFields, ModelError> {
        let fields: AreaFields =
            serde_yaml::from_value(record.clone()).map_err(ModelError::InvalidRecord)?;
        Ok(ObjectFields::Area(fields))
    }

    fn create(
        &self,
        fields: &ObjectFields,
        ctx: &WorldContext<'_>,
    ) -> Result<ObjectInstance, ModelError> {
        let f = fields.as_area()?;
        let model = AreaModel::new(f.position.x, f.position.y, f.scale.into(), f.color.into());
        ctx.viz.add_model(
            ObjectKind::Area,
            Position3D::new(f.position.x, f.position.y, 0.0),
            0.0,
            false,
            f.color.into(),
        );
        ctx.viz.change_model_scale(ctx.index, f.scale.into());
        Ok(ObjectInstance::Area(Arc::new(Mutex::new(model))))
    }

    fn update(
        &self,
        instance: &mut ObjectInstance,
        index: usize,
        fields: &ObjectFields,
        viz: &dyn VisualizationSink,
    ) -> Result<(), ModelError> {
        let f = fields.as_area()?;
        let ObjectInstance::Area(model) = instance else {
            return Err(ModelError::kind_mismatch(ObjectKind::Area, instance.kind()));
        };
        {
            let mut model = model.lock().unwrap();
            model.set_position(f.position.x, f.position.y);
            model.scale = f.scale.into();
            model.color = f.color.into();
        }
        viz.change_model_position(index, Position3D::new(f.position.x, f.position.y, 0.0), 0.0);
        viz.change_model_scale(index, f.scale.into());
        viz.change_model_color(index, f.color.into());
        Ok(())
    }

    fn start(&self, _instance: &ObjectInstance, _ctx: &WorldContext<'_>) -> Result<(), ModelError> {
        Ok(())
    }

    fn close(&self, _instance: &ObjectInstance) {}

    fn status(&self, instance: &ObjectInstance) -> BTreeMap<String, String> {
        match instance {
            ObjectInstance::Area(model) => model.lock().unwrap().status(),
            _ => BTreeMap::new(),
        }
    }
}
