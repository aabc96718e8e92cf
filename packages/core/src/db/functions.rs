//! SQL functions registered on the cache connection

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

use crate::models::RulesetVariables;

/// Whether `given` agrees with every variable recorded in `stored`
///
/// Both arguments are canonical variable JSON objects. A stored variable that
/// is absent from `given` only matches when it was stored as `null`.
pub fn variables_match(stored: &str, given: &str) -> serde_json::Result<bool> {
    let stored = RulesetVariables::from_json(stored)?;
    let given = RulesetVariables::from_json(given)?;
    Ok(given.matches(&stored))
}

/// Register `variables_match(stored, given)` on a cache connection
pub fn register_cache_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "variables_match",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let stored: String = ctx.get(0)?;
            let given: String = ctx.get(1)?;
            variables_match(&stored, &given).map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
        },
    )
}
