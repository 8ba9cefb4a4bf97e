use std::collections::HashMap;

use confdb_schema::JsonDatabag;
use confdb_state::StateData;

use crate::error::ConfdbError;

/// State key holding all persisted databags: `account -> confdb -> databag`.
pub const DATABAGS_KEY: &str = "confdb-databags";

type DatabagMap = HashMap<String, HashMap<String, JsonDatabag>>;

/// Load the databag for `(account, confdb)` from the state. An absent or
/// sparse map yields a fresh empty bag, never an error.
pub fn read_databag(
    st: &StateData,
    account: &str,
    confdb: &str,
) -> Result<JsonDatabag, ConfdbError> {
    let map: Option<DatabagMap> = st.get(DATABAGS_KEY).map_err(ConfdbError::DatabagIo)?;
    Ok(map
        .and_then(|mut m| m.get_mut(account).and_then(|s| s.remove(confdb)))
        .unwrap_or_default())
}

/// Store `bag` as the databag for `(account, confdb)`, creating the nested
/// map as needed. Callable with the state lock held.
pub fn write_databag(
    st: &mut StateData,
    bag: JsonDatabag,
    account: &str,
    confdb: &str,
) -> Result<(), ConfdbError> {
    let mut map: DatabagMap = st
        .get(DATABAGS_KEY)
        .map_err(ConfdbError::DatabagIo)?
        .unwrap_or_default();
    map.entry(account.to_string())
        .or_default()
        .insert(confdb.to_string(), bag);
    st.set(DATABAGS_KEY, &map).map_err(ConfdbError::DatabagIo)
}
