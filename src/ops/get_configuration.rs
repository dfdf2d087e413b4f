//! GetConfiguration handler

use rust_ocpp::v1_6::messages::get_configuration::{
    GetConfigurationRequest, GetConfigurationResponse,
};
use rust_ocpp::v1_6::types::KeyValue;
use serde_json::Value;

use super::OpOutcome;
use crate::model::ChargePoint;

pub(crate) fn handle(cp: &mut ChargePoint, payload: &Value) -> OpOutcome {
    let request: GetConfigurationRequest = match serde_json::from_value(payload.clone()) {
        Ok(r) => r,
        Err(e) => return OpOutcome::formation_violation(e),
    };

    let mut configuration_key = Vec::new();
    let mut unknown_key = Vec::new();

    match request.key.filter(|keys| !keys.is_empty()) {
        None => {
            for (key, readonly, value) in cp.cfg.key_values() {
                configuration_key.push(KeyValue {
                    key,
                    readonly,
                    value: Some(value),
                });
            }
        }
        Some(keys) => {
            let all = cp.cfg.key_values();
            for key in keys {
                match all.iter().find(|(known, _, _)| *known == key) {
                    Some((_, readonly, value)) => configuration_key.push(KeyValue {
                        readonly: *readonly,
                        value: Some(value.clone()),
                        key,
                    }),
                    None => unknown_key.push(key),
                }
            }
        }
    }

    OpOutcome::reply(&GetConfigurationResponse {
        configuration_key: Some(configuration_key),
        unknown_key: if unknown_key.is_empty() {
            None
        } else {
            Some(unknown_key)
        },
    })
}
