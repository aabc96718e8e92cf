//! SQL functions registered on the instance store connection

use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::borrow::Cow;
use std::panic::AssertUnwindSafe;

const NUMBER_WIDTH: usize = 20;

/// Sort key with natural number ordering
///
/// Lowercases the text and left-pads every run of digits, so `"Item 9"`
/// sorts before `"item 10"`.
pub fn sorting_value(digits: &Regex, text: &str) -> String {
    let lowered = text.to_lowercase();
    digits
        .replace_all(&lowered, |caps: &regex::Captures<'_>| {
            let run = &caps[0];
            if run.len() >= NUMBER_WIDTH {
                run.to_string()
            } else {
                format!("{}{}", "0".repeat(NUMBER_WIDTH - run.len()), run)
            }
        })
        .into_owned()
}

fn value_text(value: ValueRef<'_>) -> Option<Cow<'_, str>> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(number) => Some(Cow::Owned(number.to_string())),
        ValueRef::Real(number) => Some(Cow::Owned(number.to_string())),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Some(String::from_utf8_lossy(bytes)),
    }
}

/// Register `sorting_value(x)` on a store connection
pub fn register_store_functions(conn: &Connection) -> rusqlite::Result<()> {
    let digits = Regex::new(r"\d+").map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
    let digits = AssertUnwindSafe(digits);
    conn.create_scalar_function(
        "sorting_value",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let text = value_text(ctx.get_raw(0)).unwrap_or(Cow::Borrowed(""));
            Ok(sorting_value(&digits, &text))
        },
    )
}
