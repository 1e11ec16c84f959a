//! Private helpers for UID comparison.

use std::borrow::Cow;

/// Trim trailing padding from a UID,
/// returning the input untouched when no padding is present.
pub(crate) fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    if uid.ends_with(['\0', ' ']) {
        Cow::Owned(
            uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
                .to_string(),
        )
    } else {
        uid
    }
}
