//! Per-file coverage runtime appended to instrumented sources.
//!
//! The generated items depend on `::std` only, so an instrumented crate needs
//! no extra dependencies. Each region reports once, on its first execution,
//! as one tab-separated line:
//!
//! ```text
//! covkit <package> <file> <region> <line> <regions-in-file>
//! ```
//!
//! The sink is read from an environment variable at the time of the first
//! hit: `-` writes to stdout, any other value is a file opened for appending,
//! unset disables reporting.

use quote::format_ident;
use syn::{Item, parse_quote};

use super::{HIT_FN, HITS_STATIC, LINES_STATIC, RECORD_TAG, STDOUT_SINK};

/// Items implementing the hit function for a file with `lines.len()` regions.
pub fn runtime_items(package: &str, file: &str, sink_var: &str, lines: &[u32]) -> Vec<Item> {
    let count = lines.len();
    let hit = format_ident!("{}", HIT_FN);
    let hits = format_ident!("{}", HITS_STATIC);
    let line_table = format_ident!("{}", LINES_STATIC);
    let format = format!("{RECORD_TAG}\t{{}}\t{{}}\t{{}}\t{{}}\t{{}}\n");

    let generated: syn::File = parse_quote! {
        #[doc(hidden)]
        #[allow(non_upper_case_globals, dead_code)]
        static #hits: [::std::sync::atomic::AtomicBool; #count] = {
            const UNHIT: ::std::sync::atomic::AtomicBool = ::std::sync::atomic::AtomicBool::new(false);
            [UNHIT; #count]
        };

        #[doc(hidden)]
        #[allow(non_upper_case_globals, dead_code)]
        static #line_table: [u32; #count] = [#(#lines),*];

        #[doc(hidden)]
        #[allow(dead_code)]
        #[inline(never)]
        fn #hit(region: usize) {
            if #hits[region].swap(true, ::std::sync::atomic::Ordering::Relaxed) {
                return;
            }
            let sink = match ::std::env::var_os(#sink_var) {
                Some(sink) => sink,
                None => return,
            };
            let record = ::std::format!(#format, #package, #file, region, #line_table[region], #count);
            if sink == #STDOUT_SINK {
                let mut out = ::std::io::stdout().lock();
                let _ = ::std::io::Write::write_all(&mut out, record.as_bytes());
                let _ = ::std::io::Write::flush(&mut out);
            } else if let Ok(mut out) = ::std::fs::OpenOptions::new().create(true).append(true).open(&sink) {
                let _ = ::std::io::Write::write_all(&mut out, record.as_bytes());
            }
        }
    };
    generated.items
}
