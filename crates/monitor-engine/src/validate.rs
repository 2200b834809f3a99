use watchtower_core::result::ErrorKind;

/// Success policy for a probe outcome. This is the only place the verdict
/// is computed; every other component treats `success` as opaque.
///
/// A probe succeeds iff the transport produced no error and the observed
/// status equals the endpoint's expected status.
pub(crate) fn is_success(error_kind: ErrorKind, status: Option<u16>, expected_status: u16) -> bool {
    error_kind.is_none() && status == Some(expected_status)
}
