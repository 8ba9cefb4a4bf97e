use confdb_schema::{Databag, View, ViewError};
use serde_json::{Map, Value};

use crate::error::ConfdbError;

/// Write a batch of requests through a view. A null value unsets the
/// request. Requests are applied in the map's (sorted) key order.
pub fn set_via_view(
    bag: &mut dyn Databag,
    view: &dyn View,
    requests: &Map<String, Value>,
) -> Result<(), ConfdbError> {
    for (request, value) in requests {
        if value.is_null() {
            view.unset(bag, request)?;
        } else {
            view.set(bag, request, value.clone())?;
        }
    }
    Ok(())
}

/// Read through a view.
///
/// With no requests the whole view is returned. With one request the
/// result is `{request: value}` and missing data is an error. With several
/// requests, those that find no data are silently skipped; only if every
/// request misses does the read fail, naming them all.
pub fn get_via_view(
    bag: &dyn Databag,
    view: &dyn View,
    requests: &[String],
    constraints: Option<&Value>,
) -> Result<Value, ConfdbError> {
    if requests.is_empty() {
        return match view.get(bag, "", constraints) {
            Ok(value) => Ok(value),
            Err(ViewError::NoData { .. }) => Err(ConfdbError::NoData {
                view: view.id().clone(),
                requests: Vec::new(),
            }),
            Err(err) => Err(err.into()),
        };
    }

    let mut result = Map::new();
    for request in requests {
        match view.get(bag, request, constraints) {
            Ok(value) => {
                result.insert(request.clone(), value);
            }
            Err(ViewError::NoData { .. }) if requests.len() > 1 => continue,
            Err(ViewError::NoData { .. }) => {
                return Err(ConfdbError::NoData {
                    view: view.id().clone(),
                    requests: vec![request.clone()],
                })
            }
            Err(err) => return Err(err.into()),
        }
    }
    if result.is_empty() {
        return Err(ConfdbError::NoData {
            view: view.id().clone(),
            requests: requests.to_vec(),
        });
    }
    Ok(Value::Object(result))
}
