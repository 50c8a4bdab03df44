use common::TrafficCalculationMethod;
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "nodes")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub address: String,
    pub port: i32,
    pub usage_coefficient: f64,
    pub traffic_calculation_method: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn calculation_method(&self) -> TrafficCalculationMethod {
        TrafficCalculationMethod::from_db_value(&self.traffic_calculation_method)
    }
}
