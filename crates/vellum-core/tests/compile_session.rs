//! End-to-end compile sessions against the scripted engine.

mod support;

use std::collections::BTreeMap;

use support::{Fixture, ScriptedFactory, driver};
use vellum_core::compile::{AbortHandle, CompileOptions, CompileRequest, EngineKind};
use vellum_core::{Blob, Error};

const PLAIN: &str = "\\documentclass{article}\n\\begin{document}\nHello.\n\\end{document}\n";
const FOO_STY: &str = "/texlive/texmf-dist/tex/latex/foo/foo.sty";
const TAGGED_DOC: &str =
    "\\documentclass{article}\n\\usepackage{foo}\n\\begin{document}\n\\foo\n\\end{document}\n";

fn options(max_retries: u32, lazy: bool) -> CompileOptions {
    CompileOptions {
        max_retries: Some(max_retries),
        enable_lazy_fs: lazy,
        ..CompileOptions::default()
    }
}

/// `foo.sty` in the core bundle calls a tagging command the kernel lacks.
fn tagging_fixture() -> Fixture {
    Fixture::standard().file(FOO_STY, "core", "\\newcommand{\\foo}{}\n\\tag_mc_begin:n{artifact}")
}

fn release(version: &str) -> (String, Option<String>) {
    ("foo".to_string(), Some(version.to_string()))
}

#[tokio::test]
async fn test_plain_document_compiles_first_time() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    let host = fixture.host().serve(endpoint);

    let request =
        CompileRequest::new(PLAIN, EngineKind::PdfLatex).with_bundle("core", fixture.bundle("core"));
    let outcome = driver.compile(request).await.unwrap();

    assert!(outcome.success, "log:\n{}", outcome.log);
    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.output.is_some());
    assert!(outcome.position_log.is_some());
    assert_eq!(outcome.stats.attempts, 1);
    assert_eq!(outcome.stats.retries, 0);
    assert_eq!(outcome.stats.predicted_passes, 1);
    assert_eq!(factory.instances(), 1);
    assert!(host.bundles().is_empty());
}

#[tokio::test]
async fn test_unresolvable_macro_stops_after_one_retry() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::stubborn(&["foo"]);
    let (driver, endpoint) = driver(&fixture, &factory);
    fixture.host().serve(endpoint);

    let source = "\\documentclass{article}\n\\begin{document}\n\\foo\n\\end{document}\n";
    let request = CompileRequest::new(source, EngineKind::PdfLatex)
        .with_options(options(1, false))
        .with_bundle("core", fixture.bundle("core"));
    let outcome = driver.compile(request).await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.stats.retries, 1);
    assert_eq!(outcome.stats.attempts, 2);
    assert!(outcome.shims.contains_key("foo"));
    assert!(outcome.log.contains("Undefined control sequence"));
}

#[tokio::test]
async fn test_unchanged_log_ends_retries_early() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::stubborn(&["foo"]);
    let (driver, endpoint) = driver(&fixture, &factory);
    fixture.host().serve(endpoint);

    let source = "\\documentclass{article}\n\\begin{document}\n\\foo\n\\end{document}\n";
    let request = CompileRequest::new(source, EngineKind::PdfLatex)
        .with_options(options(10, false))
        .with_bundle("core", fixture.bundle("core"));
    let outcome = driver.compile(request).await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.stats.retries, 1);
    assert_eq!(factory.instances(), 2);
}

#[tokio::test]
async fn test_shim_makes_document_build() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    fixture.host().serve(endpoint);

    let source = "\\documentclass{article}\n\\begin{document}\nSee \\customref{a}{b} here.\n\\end{document}\n";
    let request = CompileRequest::new(source, EngineKind::PdfLatex)
        .with_bundle("core", fixture.bundle("core"));
    let outcome = driver.compile(request).await.unwrap();

    assert!(outcome.success, "log:\n{}", outcome.log);
    assert_eq!(outcome.shims.get("customref"), Some(&2));
    assert_eq!(outcome.stats.retries, 1);
}

#[tokio::test]
async fn test_missing_package_fetches_its_bundle_once() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    let host = fixture.host().serve(endpoint);

    let source = "\\documentclass{article}\n\\usepackage{extrapkg}\n\\begin{document}\n\\extra\n\\end{document}\n";
    let request = CompileRequest::new(source, EngineKind::PdfLatex)
        .with_bundle("core", fixture.bundle("core"));
    let outcome = driver.compile(request).await.unwrap();

    assert!(outcome.success, "log:\n{}", outcome.log);
    assert_eq!(host.bundles(), vec!["extra-misc".to_string()]);
    assert_eq!(outcome.stats.bundles_fetched, 1);
    assert!(driver.caches().bundles.contains("extra-misc"));
}

#[tokio::test]
async fn test_requested_bundles_are_prefetched() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    let host = fixture.host().serve(endpoint);

    let mut request = CompileRequest::new(PLAIN, EngineKind::PdfLatex);
    request.bundle_names = vec!["core".into()];
    let outcome = driver.compile(request).await.unwrap();

    assert!(outcome.success, "log:\n{}", outcome.log);
    assert_eq!(host.bundles(), vec!["core".to_string()]);
    assert_eq!(outcome.stats.attempts, 1);
}

#[tokio::test]
async fn test_deferred_file_is_fetched_as_range() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    let host = fixture.host().serve(endpoint);

    let source = "\\documentclass{article}\n\\usepackage{deferone}\n\\begin{document}\n\\one\n\\end{document}\n";
    let request = CompileRequest::new(source, EngineKind::PdfLatex)
        .with_options(options(5, true))
        .with_bundle("core", fixture.bundle("core"))
        .with_deferred_bundle("fonts");
    let outcome = driver.compile(request).await.unwrap();

    assert!(outcome.success, "log:\n{}", outcome.log);
    assert!(host.bundles().is_empty());
    assert_eq!(host.ranges().len(), 1);
    assert_eq!(host.ranges()[0].0, "fonts");
    assert_eq!(outcome.stats.ranges_fetched, 1);
    assert_eq!(driver.caches().files.len(), 1);
}

#[tokio::test]
async fn test_many_deferred_files_fetch_whole_bundle() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    let host = fixture.host().serve(endpoint);

    let source = "\\documentclass{article}\n\\usepackage{deferone,defertwo,deferthree}\n\\begin{document}\n\\one\\two\\three\n\\end{document}\n";
    let request = CompileRequest::new(source, EngineKind::PdfLatex)
        .with_options(options(5, true))
        .with_bundle("core", fixture.bundle("core"))
        .with_deferred_bundle("fonts");
    let outcome = driver.compile(request).await.unwrap();

    assert!(outcome.success, "log:\n{}", outcome.log);
    assert_eq!(host.bundles(), vec!["fonts".to_string()]);
    assert!(host.ranges().is_empty());
    assert_eq!(outcome.stats.retries, 1);
}

#[tokio::test]
async fn test_refused_bundle_falls_back_to_ranges() {
    let fixture = Fixture::new()
        .file(support::ARTICLE_CLS, "core", "\\def\\section{}")
        .file("/texlive/texmf-dist/tex/latex/nest/outera.sty", "fonts", "\\RequirePackage{innera}")
        .file("/texlive/texmf-dist/tex/latex/nest/outerb.sty", "fonts", "\\RequirePackage{innerb}")
        .file("/texlive/texmf-dist/tex/latex/nest/outerc.sty", "fonts", "\\RequirePackage{innerc}")
        .file("/texlive/texmf-dist/tex/latex/nest/innera.sty", "fonts", "\\newcommand{\\ina}{}")
        .file("/texlive/texmf-dist/tex/latex/nest/innerb.sty", "fonts", "\\newcommand{\\inb}{}")
        .file("/texlive/texmf-dist/tex/latex/nest/innerc.sty", "fonts", "\\newcommand{\\inc}{}");
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    let host = fixture.host().refuse_bundle("fonts").serve(endpoint);

    let source = "\\documentclass{article}\n\\usepackage{outera,outerb,outerc}\n\\begin{document}\n\\ina\\inb\\inc\n\\end{document}\n";
    let request = CompileRequest::new(source, EngineKind::PdfLatex)
        .with_options(options(5, true))
        .with_bundle("core", fixture.bundle("core"))
        .with_deferred_bundle("fonts");
    let outcome = driver.compile(request).await.unwrap();

    assert!(outcome.success, "log:\n{}", outcome.log);
    // Outer files on the first pass, the files they require on the second.
    assert_eq!(host.bundles(), vec!["fonts".to_string()]);
    assert_eq!(host.ranges().len(), 6);
    assert!(host.ranges().iter().all(|(bundle, ..)| bundle == "fonts"));
    assert_eq!(outcome.stats.ranges_fetched, 6);
    assert_eq!(outcome.stats.bundles_fetched, 0);
    assert_eq!(outcome.stats.retries, 2);
    assert!(!driver.caches().bundles.contains("fonts"));
    assert_eq!(driver.caches().files.len(), 6);
}

#[tokio::test]
async fn test_deferred_bundles_ignored_without_lazy_mode() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    let host = fixture.host().serve(endpoint);

    let source = "\\documentclass{article}\n\\usepackage{deferone}\n\\begin{document}\n\\one\n\\end{document}\n";
    let request = CompileRequest::new(source, EngineKind::PdfLatex)
        .with_options(options(5, false))
        .with_bundle("core", fixture.bundle("core"))
        .with_deferred_bundle("fonts");
    let outcome = driver.compile(request).await.unwrap();

    assert!(outcome.success, "log:\n{}", outcome.log);
    assert_eq!(host.bundles(), vec!["fonts".to_string()]);
    assert!(host.ranges().is_empty());
}

#[tokio::test]
async fn test_unknown_package_falls_back_to_package_source() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    let host = fixture
        .host()
        .with_package(
            "adhoc",
            "/texlive/texmf-dist/tex/latex/adhoc/adhoc.sty",
            "\\newcommand{\\adhoc}{}",
        )
        .serve(endpoint);

    let source = "\\documentclass{article}\n\\usepackage{adhoc}\n\\begin{document}\n\\adhoc\n\\end{document}\n";
    let request = CompileRequest::new(source, EngineKind::PdfLatex)
        .with_options(CompileOptions {
            enable_ctan: true,
            ..CompileOptions::default()
        })
        .with_bundle("core", fixture.bundle("core"));
    let outcome = driver.compile(request).await.unwrap();

    assert!(outcome.success, "log:\n{}", outcome.log);
    assert_eq!(host.packages(), vec![("adhoc".to_string(), None)]);
    assert_eq!(outcome.stats.packages_fetched, 1);
}

#[tokio::test]
async fn test_unknown_package_without_fallback_fails() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    let host = fixture.host().serve(endpoint);

    let source = "\\documentclass{article}\n\\usepackage{adhoc}\n\\begin{document}\n\\end{document}\n";
    let request = CompileRequest::new(source, EngineKind::PdfLatex)
        .with_bundle("core", fixture.bundle("core"));
    let outcome = driver.compile(request).await.unwrap();

    assert!(!outcome.success);
    assert!(outcome.log.contains("File `adhoc.sty' not found"));
    assert!(host.packages().is_empty());
    assert_eq!(outcome.stats.retries, 0);
}

#[tokio::test]
async fn test_kernel_feature_pins_older_release() {
    let fixture = tagging_fixture();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    let host = fixture
        .host()
        .with_package("foo@2023", FOO_STY, "\\newcommand{\\foo}{}")
        .serve(endpoint);

    let request = CompileRequest::new(TAGGED_DOC, EngineKind::PdfLatex)
        .with_options(CompileOptions {
            enable_ctan: true,
            ..CompileOptions::default()
        })
        .with_bundle("core", fixture.bundle("core"));
    let outcome = driver.compile(request).await.unwrap();

    assert!(outcome.success, "log:\n{}", outcome.log);
    assert_eq!(
        outcome.version_overrides,
        BTreeMap::from([("foo".to_string(), "2023".to_string())])
    );
    assert_eq!(host.packages(), vec![release("2024"), release("2023")]);
    assert!(!outcome.shims.contains_key("tag_mc_begin:n"));
    assert_eq!(outcome.stats.packages_fetched, 1);
    assert_eq!(outcome.stats.retries, 1);
}

#[tokio::test]
async fn test_owners_fall_back_in_one_round() {
    let bar_sty = "/texlive/texmf-dist/tex/latex/bar/bar.sty";
    let fixture = tagging_fixture().file(
        bar_sty,
        "core",
        "\\newcommand{\\bar}{}\n\\tag_struct_begin:n{part}",
    );
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    let host = fixture
        .host()
        .with_package("foo@2023", FOO_STY, "\\newcommand{\\foo}{}")
        .with_package("bar@2024", bar_sty, "\\newcommand{\\bar}{}")
        .serve(endpoint);

    let source = "\\documentclass{article}\n\\usepackage{foo,bar}\n\\begin{document}\n\\foo\\bar\n\\end{document}\n";
    let request = CompileRequest::new(source, EngineKind::PdfLatex)
        .with_options(CompileOptions {
            enable_ctan: true,
            ..CompileOptions::default()
        })
        .with_bundle("core", fixture.bundle("core"));
    let outcome = driver.compile(request).await.unwrap();

    assert!(outcome.success, "log:\n{}", outcome.log);
    assert_eq!(outcome.stats.retries, 1);
    assert_eq!(outcome.version_overrides["foo"], "2023");
    assert_eq!(outcome.version_overrides["bar"], "2024");
    assert_eq!(host.packages().len(), 3);
    assert!(outcome.shims.is_empty());
}

#[tokio::test]
async fn test_kernel_feature_shimmed_once_releases_run_out() {
    let fixture = tagging_fixture();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    let host = fixture.host().serve(endpoint);

    let request = CompileRequest::new(TAGGED_DOC, EngineKind::PdfLatex)
        .with_options(CompileOptions {
            enable_ctan: true,
            max_retries: Some(5),
            ..CompileOptions::default()
        })
        .with_bundle("core", fixture.bundle("core"));
    let outcome = driver.compile(request).await.unwrap();

    assert_eq!(
        host.packages(),
        vec![release("2024"), release("2023"), release("2022")]
    );
    assert!(outcome.version_overrides.is_empty());
    assert_eq!(outcome.shims.get("tag_mc_begin:n"), Some(&1));
    assert_eq!(outcome.stats.packages_fetched, 0);
    // The shim is defined after \usepackage, too late for the package body;
    // the second pass changes nothing and no release is asked for again.
    assert!(!outcome.success);
    assert_eq!(outcome.stats.retries, 1);
}

#[tokio::test]
async fn test_kernel_feature_shimmed_without_package_source() {
    let fixture = tagging_fixture();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    let host = fixture.host().serve(endpoint);

    let request = CompileRequest::new(TAGGED_DOC, EngineKind::PdfLatex)
        .with_options(options(5, false))
        .with_bundle("core", fixture.bundle("core"));
    let outcome = driver.compile(request).await.unwrap();

    assert!(host.packages().is_empty());
    assert_eq!(outcome.shims.get("tag_mc_begin:n"), Some(&1));
}

#[tokio::test]
async fn test_rerun_stops_when_aux_settles() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    fixture.host().serve(endpoint);

    let source = "\\documentclass{article}\n\\begin{document}\n\\tableofcontents\n\\section{A}\\label{a}\nSee \\ref{a}.\n\\end{document}\n";
    let request = CompileRequest::new(source, EngineKind::PdfLatex)
        .with_bundle("core", fixture.bundle("core"));
    let outcome = driver.compile(request).await.unwrap();

    assert!(outcome.success, "log:\n{}", outcome.log);
    assert_eq!(outcome.stats.predicted_passes, 3);
    assert_eq!(outcome.stats.reruns, 1);
    assert_eq!(factory.instances(), 2);
    assert!(outcome.aux_files_to_cache.contains_key("main.aux"));
}

#[tokio::test]
async fn test_cached_aux_skips_rerun() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    fixture.host().serve(endpoint);

    let source = "\\documentclass{article}\n\\begin{document}\n\\section{A}\\label{a}\nSee \\ref{a}.\n\\end{document}\n";
    let first = driver
        .compile(
            CompileRequest::new(source, EngineKind::PdfLatex)
                .with_bundle("core", fixture.bundle("core")),
        )
        .await
        .unwrap();
    assert_eq!(first.stats.reruns, 1);

    let before = factory.instances();
    let second = driver
        .compile(
            CompileRequest::new(source, EngineKind::PdfLatex)
                .with_bundle("core", fixture.bundle("core"))
                .with_aux_files(first.aux_files_to_cache.clone()),
        )
        .await
        .unwrap();
    assert!(second.success);
    assert_eq!(second.stats.reruns, 0);
    assert_eq!(factory.instances() - before, 1);
}

#[tokio::test]
async fn test_xelatex_runs_two_stages() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    fixture.host().serve(endpoint);

    let request =
        CompileRequest::new(PLAIN, EngineKind::XeLatex).with_bundle("core", fixture.bundle("core"));
    let outcome = driver.compile(request).await.unwrap();

    assert!(outcome.success, "log:\n{}", outcome.log);
    assert_eq!(outcome.stats.sandbox_instances, 2);
    assert_eq!(factory.instances(), 2);
}

#[tokio::test]
async fn test_abort_between_retries() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    fixture.host().serve(endpoint);

    let abort = AbortHandle::new();
    abort.abort();
    let source = "\\documentclass{article}\n\\begin{document}\n\\foo\n\\end{document}\n";
    let request = CompileRequest::new(source, EngineKind::PdfLatex)
        .with_bundle("core", fixture.bundle("core"))
        .with_abort(abort);

    assert!(matches!(driver.compile(request).await, Err(Error::Aborted)));
    assert_eq!(factory.instances(), 1);
}

#[tokio::test]
async fn test_supplied_package_files_are_mounted() {
    let fixture = Fixture::standard();
    let factory = ScriptedFactory::new();
    let (driver, endpoint) = driver(&fixture, &factory);
    let host = fixture.host().serve(endpoint);

    let mut request = CompileRequest::new(
        "\\documentclass{article}\n\\usepackage{local}\n\\begin{document}\n\\loc\n\\end{document}\n",
        EngineKind::PdfLatex,
    )
    .with_bundle("core", fixture.bundle("core"));
    request.ctan_files = BTreeMap::from([(
        "/texlive/texmf-dist/tex/latex/local/local.sty".to_string(),
        Blob::from(b"\\newcommand{\\loc}{}".to_vec()),
    )]);
    let outcome = driver.compile(request).await.unwrap();

    assert!(outcome.success, "log:\n{}", outcome.log);
    assert!(host.packages().is_empty());
}
