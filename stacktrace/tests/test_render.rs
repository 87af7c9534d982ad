use std::io::{self, Write};
use std::path::PathBuf;

use stacktrace::{Address, ResolverInitError, ResolverOptions, StackTrace, SymbolResolver};
use tempfile::NamedTempFile;

fn resolver_for_maps(contents: &str) -> (SymbolResolver, NamedTempFile) {
    let mut maps = NamedTempFile::new().expect("Failed to create temp file");
    maps.write_all(contents.as_bytes()).expect("Failed to write maps");
    let resolver = SymbolResolver::with_options(ResolverOptions {
        maps_path: maps.path().to_path_buf(),
        ..ResolverOptions::default()
    });
    (resolver, maps)
}

#[inline(never)]
fn captured() -> StackTrace {
    std::hint::black_box(StackTrace::capture())
}

#[test]
fn test_failed_resolver_dumps_raw_addresses() {
    let (resolver, _maps) = resolver_for_maps("1000-2000 r--p 00000000 00:00 0 /data\n");
    assert!(matches!(resolver.init_error(), Some(ResolverInitError::NoModules(_))));

    let trace = captured();
    let mut out = Vec::new();
    trace.render_with(&resolver, &mut out).expect("write to Vec");
    let out = String::from_utf8(out).expect("utf8");
    let lines: Vec<&str> = out.lines().collect();

    assert_eq!(lines[0], "Error initializing symbols (-1).  Dumping unresolved backtrace:");
    assert_eq!(lines.len(), trace.len() + 1);
    for (line, address) in lines[1..].iter().zip(trace.addresses()) {
        assert_eq!(*line, format!("\t{address}"));
    }
}

#[test]
fn test_malformed_maps_is_an_init_error() {
    let (resolver, _maps) = resolver_for_maps("not a maps file\n");
    let err = resolver.init_error().expect("maps are malformed");

    assert!(matches!(err, ResolverInitError::ModuleMapMalformed { line: 1, .. }));
    assert_eq!(err.code(), -1);
}

#[test]
fn test_missing_maps_reports_os_error() {
    let resolver = SymbolResolver::with_options(ResolverOptions {
        maps_path: PathBuf::from("/nonexistent/stacktrace/maps"),
        ..ResolverOptions::default()
    });
    let trace: StackTrace = StackTrace::empty();
    let mut out = Vec::new();

    trace.render_with(&resolver, &mut out).expect("write to Vec");
    assert_eq!(
        String::from_utf8(out).expect("utf8"),
        format!("Error initializing symbols ({}).  Dumping unresolved backtrace:\n", libc::ENOENT)
    );
}

#[test]
fn test_report_header_and_entries() {
    let trace = captured();
    let mut out = Vec::new();

    trace.output_to_stream(&mut out).expect("write to Vec");
    let out = String::from_utf8(out).expect("utf8");

    assert!(out.starts_with("\n\nBacktrace:\n\t"), "{out}");
    assert!(out.contains("captured ["), "{out}");
    assert!(out.contains("\n\t\t module: "), "{out}");
    assert!(out.ends_with('\n'));
}

#[test]
fn test_unmapped_address_has_no_symbol() {
    let resolver = SymbolResolver::new();
    let mut out = Vec::new();

    resolver.render_trace(&[Address(0x10)], &mut out).expect("write to Vec");
    assert_eq!(String::from_utf8(out).expect("utf8"), "\t(No symbol) [0x10]\n");
}

/// Sink that rejects every write
struct BrokenSink {
    attempts: usize,
}

impl Write for BrokenSink {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        self.attempts += 1;
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_rendering_stops_at_first_failed_write() {
    let resolver = SymbolResolver::new();
    let mut sink = BrokenSink { attempts: 0 };
    let addresses = [Address(0x10), Address(0x20), Address(0x30)];

    let err = resolver.render_trace(&addresses, &mut sink).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    assert_eq!(sink.attempts, 1);

    let trace = captured();
    let mut sink = BrokenSink { attempts: 0 };
    assert!(trace.render_with(&resolver, &mut sink).is_err());
    assert_eq!(sink.attempts, 1);
}

#[test]
fn test_resolver_is_reusable_across_traces() {
    let resolver = SymbolResolver::new();
    let first = captured();
    let second = captured();
    let mut a = Vec::new();
    let mut b = Vec::new();

    first.render_with(&resolver, &mut a).expect("write to Vec");
    second.render_with(&resolver, &mut b).expect("write to Vec");

    // Both traces start at the same call site
    let innermost = |out: &[u8]| String::from_utf8_lossy(out).lines().nth(3).map(str::to_string);
    let entry = innermost(&a).expect("at least one entry");
    assert!(entry.contains("captured ["), "{entry}");
    assert_eq!(Some(entry), innermost(&b));
}
