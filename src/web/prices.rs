//! Card price lookup response

use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

use crate::core::AppId;

/// Price endpoint payload. The service wraps the map in `avg_values`;
/// a bare id → price map is accepted too.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PriceResponse {
    Wrapped {
        avg_values: HashMap<String, serde_json::Value>,
    },
    Flat(HashMap<String, serde_json::Value>),
}

/// Parse a price response into an id → average card price map.
/// Keys that are not app ids and values that are not numbers are skipped.
pub fn parse_prices(body: &str) -> Result<HashMap<AppId, f64>, serde_json::Error> {
    let raw = match serde_json::from_str::<PriceResponse>(body)? {
        PriceResponse::Wrapped { avg_values } => avg_values,
        PriceResponse::Flat(map) => map,
    };

    let mut prices = HashMap::with_capacity(raw.len());
    for (key, value) in raw {
        let Ok(appid) = key.trim().parse::<AppId>() else {
            debug!("Ignoring price entry with malformed id {:?}", key);
            continue;
        };
        let price = match &value {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match price {
            Some(p) if p.is_finite() => {
                prices.insert(appid, p);
            }
            _ => debug!("Ignoring malformed price {} for app {}", value, appid),
        }
    }
    Ok(prices)
}
