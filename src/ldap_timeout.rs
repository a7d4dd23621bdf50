//! Timeout-bounded LDAP round trips
//!
//! ldap3's `LdapConn` blocks, and a hung domain controller would otherwise
//! pin a worker thread forever. Every call here carries an explicit timeout.
//! These helpers are synchronous; callers already run on blocking threads.

use crate::errors::{AuditError, AuditResult};
use ldap3::controls::{ControlParser, PagedResults, RawControl};
use ldap3::{LdapConn, LdapConnSettings, LdapResult, Scope, SearchEntry};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default page size for paged searches
pub const DEFAULT_PAGE_SIZE: i32 = 500;

const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";
const SD_FLAGS_OID: &str = "1.2.840.113556.1.4.801";

/// rc=4, sizeLimitExceeded
const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
/// rc=32, noSuchObject
const RC_NO_SUCH_OBJECT: u32 = 32;

/// Request owner, group and DACL in `nTSecurityDescriptor` reads. Without it
/// AD also asks for the SACL, which ordinary accounts may not read.
pub fn sd_flags_control() -> RawControl {
    RawControl {
        ctype: SD_FLAGS_OID.to_string(),
        crit: true,
        val: Some(vec![0x30, 0x03, 0x02, 0x01, 0x07]),
    }
}

/// Open a connection, bounded by `connect_timeout`.
///
/// TLS certificate verification is disabled so LDAPS works against
/// internal CAs.
pub fn connect_with_timeout(url: &str, connect_timeout: Duration) -> AuditResult<LdapConn> {
    let settings = LdapConnSettings::new()
        .set_conn_timeout(connect_timeout)
        .set_no_tls_verify(true);

    LdapConn::with_settings(settings, url).map_err(|e| {
        error!("LDAP connection to {} failed: {}", url, e);
        AuditError::Connectivity(format!(
            "Could not connect to {} within {} seconds: {}",
            url,
            connect_timeout.as_secs(),
            e
        ))
    })
}

/// Simple bind; a rejected bind is `AccessDenied` or `Connectivity` per rc.
pub fn bind_with_timeout(
    ldap: &mut LdapConn,
    username: &str,
    password: &str,
    bind_timeout: Duration,
) -> AuditResult<()> {
    ldap.with_timeout(bind_timeout)
        .simple_bind(username, password)?
        .success()?;
    debug!("Bound as {}", username);
    Ok(())
}

/// Interpret a search result code. `Ok(false)` means the base object does
/// not exist and the caller should treat the search as empty.
fn accept_result(result: LdapResult, base_dn: &str, returned: usize) -> AuditResult<bool> {
    match result.rc {
        0 => Ok(true),
        RC_SIZE_LIMIT_EXCEEDED => {
            warn!(
                "Size limit exceeded searching {}, keeping {} partial entries",
                base_dn, returned
            );
            Ok(true)
        }
        RC_NO_SUCH_OBJECT => {
            debug!("{} does not exist", base_dn);
            Ok(false)
        }
        _ => {
            error!("Search of {} failed with rc={}: {}", base_dn, result.rc, result.text);
            result.success()?;
            Ok(true)
        }
    }
}

/// Single-request search with optional extra controls.
pub fn search_with_timeout(
    ldap: &mut LdapConn,
    base_dn: &str,
    scope: Scope,
    filter: &str,
    attrs: &[&str],
    controls: Vec<RawControl>,
    search_timeout: Duration,
) -> AuditResult<Vec<SearchEntry>> {
    debug!("Searching {} with {}", base_dn, filter);

    let result = ldap
        .with_timeout(search_timeout)
        .with_controls(controls)
        .search(base_dn, scope, filter, attrs.to_vec())?;

    let entries = result.0;
    if !accept_result(result.1, base_dn, entries.len())? {
        return Ok(Vec::new());
    }

    Ok(entries.into_iter().map(SearchEntry::construct).collect())
}

/// Search that follows the Simple Paged Results cookie until the server
/// reports no more pages. AD caps unpaged results at 1000 entries.
///
/// `search_timeout` bounds each page request.
pub fn paged_search_with_timeout(
    ldap: &mut LdapConn,
    base_dn: &str,
    scope: Scope,
    filter: &str,
    attrs: &[&str],
    page_size: i32,
    search_timeout: Duration,
) -> AuditResult<Vec<SearchEntry>> {
    let mut all_entries = Vec::new();
    let mut cookie: Vec<u8> = Vec::new();
    let mut page_count = 0;

    loop {
        page_count += 1;
        let paged_control = PagedResults {
            size: page_size,
            cookie: cookie.clone(),
        };

        let result = ldap
            .with_timeout(search_timeout)
            .with_controls(vec![paged_control.into()])
            .search(base_dn, scope, filter, attrs.to_vec())?;

        let entries = result.0;
        let ldap_result = result.1;

        let mut next_cookie = Vec::new();
        for ctrl in &ldap_result.ctrls {
            let raw_ctrl = &ctrl.1;
            if raw_ctrl.ctype == PAGED_RESULTS_OID {
                if let Some(ref val) = raw_ctrl.val {
                    let pr: PagedResults = PagedResults::parse(val);
                    next_cookie = pr.cookie;
                }
                break;
            }
        }

        let in_page = entries.len();
        if !accept_result(ldap_result, base_dn, in_page)? {
            return Ok(Vec::new());
        }
        all_entries.extend(entries.into_iter().map(SearchEntry::construct));

        debug!(
            "Page {} of {} returned {} entries ({} total)",
            page_count,
            base_dn,
            in_page,
            all_entries.len()
        );

        if next_cookie.is_empty() {
            break;
        }
        cookie = next_cookie;
    }

    Ok(all_entries)
}
