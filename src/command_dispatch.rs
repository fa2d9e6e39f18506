//! Purpose: Hold top-level CLI command dispatch for `bibserve`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Command behavior, output envelopes, and exit code semantics stay unchanged.
//! Invariants: Helpers in `main.rs` remain the source of command business logic.

use super::*;

pub(super) fn dispatch_command(
    command: Command,
    service: ServiceConfig,
    color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            clap_complete::aot::generate(shell, &mut Cli::command(), "bibserve", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output(color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Doctor {
            snapshot,
            all,
            json,
        } => {
            if all && snapshot.is_some() {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("--all cannot be combined with a snapshot tag")
                    .with_hint("Use `bibserve doctor --all` or `bibserve doctor <tag>`."));
            }
            let catalog = catalog_from(&service);
            let reports = if all {
                let statuses = catalog.list_snapshots()?;
                let mut reports = Vec::with_capacity(statuses.len());
                for status in &statuses {
                    reports.push(catalog.validate_snapshot(&status.snapshot)?);
                }
                reports
            } else {
                let tag = snapshot.unwrap_or_else(|| service.snapshot.clone());
                vec![catalog.validate_snapshot(&tag)?]
            };

            let corrupt = reports
                .iter()
                .any(|report| report.status == ValidationStatus::Corrupt);

            if json {
                let values = reports.iter().map(report_json).collect::<Vec<_>>();
                emit_json(json!({ "reports": values }), color_mode);
            } else if all {
                emit_doctor_human_summary(&reports);
            } else if let Some(report) = reports.first() {
                emit_doctor_human(report);
            }

            if corrupt {
                return Ok(RunOutcome::with_code(to_exit_code(ErrorKind::Corrupt)));
            }
            Ok(RunOutcome::ok())
        }
        Command::Serve { subcommand, run } => match subcommand {
            Some(ServeSubcommand::Init(args)) => {
                let bind: SocketAddr = args.bind.parse().map_err(|_| {
                    Error::new(ErrorKind::Usage)
                        .with_message("invalid bind address")
                        .with_hint("Use a host:port value like 0.0.0.0:9013.")
                })?;
                let result = serve_init::init(serve_init::ServeInitConfig {
                    output_dir: args.output_dir,
                    secret_file: args.api_secret_file,
                    tls_cert: args.tls_cert,
                    tls_key: args.tls_key,
                    bind,
                    force: args.force,
                })?;
                if io::stdout().is_terminal() {
                    emit_serve_init_human(&result);
                } else {
                    emit_json(
                        json!({
                            "init": {
                                "artifact_paths": {
                                    "secret_file": result.secret_file,
                                    "tls_cert": result.tls_cert,
                                    "tls_key": result.tls_key
                                },
                                "tls_fingerprint": result.tls_fingerprint,
                                "server_commands": result.server_commands,
                                "client_commands": result.client_commands,
                                "curl_client_commands": result.curl_client_commands
                            }
                        }),
                        color_mode,
                    );
                }
                Ok(RunOutcome::ok())
            }
            Some(ServeSubcommand::Check { json }) => {
                let config = serve_config_from_run_args(run, &service)?;
                serve::preflight(&config)?;
                emit_serve_check_report(&config, color_mode, json);
                Ok(RunOutcome::ok())
            }
            None => {
                let config = serve_config_from_run_args(run, &service)?;
                emit_env_parity_notices(&service, color_mode);
                emit_serve_startup_guidance(&config);
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .map_err(|err| {
                        Error::new(ErrorKind::Internal)
                            .with_message("failed to start runtime")
                            .with_source(err)
                    })?;
                runtime.block_on(serve::serve(config))?;
                Ok(RunOutcome::ok())
            }
        },
        Command::Fetch {
            docid,
            format,
            remote,
            secret,
            secret_file,
            tls_ca,
            insecure,
        } => {
            let envelope = match remote {
                Some(remote) => {
                    let client =
                        remote_client(&remote, secret, secret_file, tls_ca, insecure, &service)?;
                    client.fetch_record(&docid)?
                }
                None => {
                    reject_remote_only_flags_for_local_fetch(
                        secret.as_deref(),
                        secret_file.as_deref(),
                        tls_ca.as_deref(),
                        insecure,
                    )?;
                    local_resolver(&service)?.resolve(&docid)?
                }
            };
            emit_record_output(&envelope, format, color_mode)?;
            Ok(RunOutcome::ok())
        }
        Command::Search {
            query,
            structured,
            limit,
            where_expr,
            json,
        } => {
            let parsed = if structured {
                SearchQuery::Struct(parse_inline_json(&query)?)
            } else {
                SearchQuery::DocId(query)
            };
            let filters = compile_filters(&where_expr)?;
            let store = catalog_from(&service).store()?;
            let limit = clamp_limit(limit);
            let hits = search(&store, &service.snapshot, &parsed, limit)?;
            let mut matched = Vec::with_capacity(hits.len());
            for hit in hits {
                if matches_all(&filters, &hit.bibitem)? {
                    matched.push(hit);
                }
            }
            if json || !io::stdout().is_terminal() {
                emit_json(json!({ "hits": matched }), color_mode);
            } else {
                emit_search_table(&matched);
            }
            Ok(RunOutcome::ok())
        }
        Command::Ingest {
            snapshot,
            files,
            input,
            errors,
            strict,
        } => {
            ensure_snapshot_tag(&snapshot)?;
            let catalog = catalog_from(&service);
            let started = Instant::now();
            let mut totals = IngestOutcome::default();
            let sources = if files.is_empty() {
                vec!["-".to_string()]
            } else {
                files
            };
            for source in &sources {
                let reader = open_input_reader(source)?;
                let label = if source == "-" { "stdin" } else { source };
                let outcome = ingest_records(
                    reader,
                    IngestContext {
                        catalog: &catalog,
                        snapshot: &snapshot,
                        source_label: label,
                        strict,
                        input,
                        errors,
                        color_mode,
                    },
                )?;
                totals.records_total += outcome.records_total;
                totals.ok += outcome.ok;
                totals.failed += outcome.failed;
            }
            emit_json(
                json!({
                    "ingest": {
                        "snapshot": snapshot,
                        "stored": totals.ok,
                        "skipped": totals.failed,
                        "elapsed_ms": started.elapsed().as_millis() as u64
                    }
                }),
                color_mode,
            );
            if totals.failed > 0 {
                return Ok(RunOutcome::with_code(1));
            }
            Ok(RunOutcome::ok())
        }
        Command::Snapshot { command } => dispatch_snapshot_command(command, service, color_mode),
    }
}

fn dispatch_snapshot_command(
    command: SnapshotCommand,
    service: ServiceConfig,
    color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    let catalog = catalog_from(&service);
    match command {
        SnapshotCommand::Create { tag } => {
            let manifest = catalog.create_snapshot(&tag)?;
            emit_json(
                json!({
                    "created": {
                        "snapshot": manifest.snapshot,
                        "created": manifest.created
                    }
                }),
                color_mode,
            );
            Ok(RunOutcome::ok())
        }
        SnapshotCommand::List { json } => {
            let statuses = catalog.list_snapshots()?;
            if json || !io::stdout().is_terminal() {
                emit_json(json!({ "snapshots": statuses }), color_mode);
            } else {
                emit_snapshot_list_table(&statuses);
            }
            Ok(RunOutcome::ok())
        }
        SnapshotCommand::Info { tag } => {
            let status = catalog.snapshot_status(&tag)?;
            emit_json(json!({ "snapshot": status }), color_mode);
            Ok(RunOutcome::ok())
        }
        SnapshotCommand::Delete { tag, force } => {
            if tag == service.snapshot && !force {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("refusing to delete the active snapshot")
                    .with_snapshot(tag)
                    .with_hint("Pass --force to delete it anyway, or switch SNAPSHOT first."));
            }
            catalog.delete_snapshot(&tag)?;
            emit_json(json!({ "deleted": { "snapshot": tag } }), color_mode);
            Ok(RunOutcome::ok())
        }
    }
}
