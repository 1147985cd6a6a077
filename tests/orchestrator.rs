mod common;

use std::time::Duration;

use assert_matches::assert_matches;

use common::{FakeResolver, ScriptedTransport, Step};
use kira_sra_fetch::config::{AwsCredentials, GcpCredentials, PaidPolicy, RetryPolicy};
use kira_sra_fetch::container::LocalArchive;
use kira_sra_fetch::domain::{DownloadMethod, Provider, RunAccession};
use kira_sra_fetch::error::KiraError;
use kira_sra_fetch::orchestrator::{DownloadOutcome, FetchRequest, FetchResult, Orchestrator};
use kira_sra_fetch::transport::TransportMethod;

fn accession() -> RunAccession {
    "SRR12118866".parse().unwrap()
}

fn fetch(
    orchestrator: &Orchestrator<FakeResolver, ScriptedTransport>,
    methods: &[TransportMethod],
    policy: PaidPolicy,
    require_sra: bool,
) -> Result<FetchResult, KiraError> {
    let work = tempfile::tempdir().unwrap();
    let accession = accession();
    orchestrator.fetch(&FetchRequest {
        accession: &accession,
        methods,
        policy,
        require_sra,
        work_dir: work.path(),
        timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
        },
    })
}

fn aws_cp() -> TransportMethod {
    TransportMethod::AwsCp { credentials: None }
}

#[test]
fn falls_through_to_first_success_in_order() {
    let transport = ScriptedTransport::with(vec![
        (DownloadMethod::AwsHttp, vec![Step::Permanent]),
        (DownloadMethod::Prefetch, vec![Step::Permanent]),
        (DownloadMethod::AwsCp, vec![Step::Deliver]),
        (DownloadMethod::EnaFtp, vec![Step::Deliver]),
    ]);
    let orchestrator = Orchestrator::new(FakeResolver::default(), transport);
    let methods = [
        TransportMethod::AwsHttp,
        TransportMethod::Prefetch,
        aws_cp(),
        TransportMethod::EnaFtp,
    ];

    let result = fetch(&orchestrator, &methods, PaidPolicy::default(), false).unwrap();

    assert_eq!(result.method, DownloadMethod::AwsCp);
    assert_matches!(result.archive, LocalArchive::Sra(_));
    assert_eq!(
        orchestrator.transport().calls(),
        vec![
            DownloadMethod::AwsHttp,
            DownloadMethod::Prefetch,
            DownloadMethod::AwsCp
        ]
    );
    let outcomes: Vec<_> = result.attempts.iter().map(|attempt| attempt.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            DownloadOutcome::PermanentFailure,
            DownloadOutcome::PermanentFailure,
            DownloadOutcome::Success
        ]
    );
    assert_eq!(result.attempts[2].local_paths.len(), 1);
}

#[test]
fn transient_failures_are_retried_within_budget() {
    let transport = ScriptedTransport::with(vec![(
        DownloadMethod::AwsHttp,
        vec![Step::Transient, Step::Transient, Step::Deliver],
    )]);
    let orchestrator = Orchestrator::new(FakeResolver::default(), transport);

    let result = fetch(
        &orchestrator,
        &[TransportMethod::AwsHttp],
        PaidPolicy::default(),
        false,
    )
    .unwrap();

    assert_eq!(result.attempts[0].tries, 3);
    assert_eq!(orchestrator.transport().calls_for(DownloadMethod::AwsHttp), 3);
}

#[test]
fn exhausted_retries_move_to_next_method() {
    let transport = ScriptedTransport::with(vec![
        (
            DownloadMethod::AwsHttp,
            vec![Step::Transient, Step::Transient, Step::Transient, Step::Deliver],
        ),
        (DownloadMethod::Prefetch, vec![Step::Deliver]),
    ]);
    let orchestrator = Orchestrator::new(FakeResolver::default(), transport);

    let result = fetch(
        &orchestrator,
        &[TransportMethod::AwsHttp, TransportMethod::Prefetch],
        PaidPolicy::default(),
        false,
    )
    .unwrap();

    assert_eq!(result.method, DownloadMethod::Prefetch);
    assert_eq!(result.attempts[0].outcome, DownloadOutcome::TransientFailure);
    assert_eq!(result.attempts[0].tries, 3);
    assert_eq!(
        result.attempts[0].reason.as_deref(),
        Some("503 service unavailable")
    );
}

#[test]
fn timeout_is_not_retried() {
    let transport = ScriptedTransport::with(vec![
        (DownloadMethod::AwsHttp, vec![Step::TimedOut, Step::Deliver]),
        (DownloadMethod::Prefetch, vec![Step::Deliver]),
    ]);
    let orchestrator = Orchestrator::new(FakeResolver::default(), transport);

    let result = fetch(
        &orchestrator,
        &[TransportMethod::AwsHttp, TransportMethod::Prefetch],
        PaidPolicy::default(),
        false,
    )
    .unwrap();

    assert_eq!(orchestrator.transport().calls_for(DownloadMethod::AwsHttp), 1);
    assert_eq!(result.attempts[0].outcome, DownloadOutcome::TransientFailure);
    assert_eq!(result.method, DownloadMethod::Prefetch);
}

#[test]
fn paid_gcp_without_opt_in_never_reaches_transport() {
    let transport = ScriptedTransport::with(vec![(DownloadMethod::GcpCp, vec![Step::Deliver])]);
    let orchestrator = Orchestrator::new(FakeResolver::default(), transport);
    let methods = [TransportMethod::GcpCp(GcpCredentials::default())];

    let err = fetch(&orchestrator, &methods, PaidPolicy::default(), false).unwrap_err();

    assert_matches!(err, KiraError::Policy(_));
    assert!(orchestrator.transport().calls().is_empty());
    assert!(orchestrator.resolver().calls.lock().unwrap().is_empty());

    let allowed = PaidPolicy::from_flags(false, false, true);
    let result = fetch(&orchestrator, &methods, allowed, false).unwrap();
    assert_eq!(result.method, DownloadMethod::GcpCp);
}

#[test]
fn aws_cp_is_gated_on_resolved_tier() {
    let resolver = FakeResolver {
        paid: vec![Provider::AwsCloud],
        ..FakeResolver::default()
    };
    let transport = ScriptedTransport::with(vec![
        (DownloadMethod::AwsCp, vec![Step::Deliver]),
        (DownloadMethod::EnaFtp, vec![Step::Permanent]),
    ]);
    let orchestrator = Orchestrator::new(resolver, transport);
    let methods = [aws_cp(), TransportMethod::EnaFtp];

    let err = fetch(&orchestrator, &methods, PaidPolicy::default(), false).unwrap_err();
    let KiraError::OrchestratorExhausted { attempts } = err else {
        panic!("expected exhausted orchestrator");
    };
    assert_eq!(attempts[0].outcome, DownloadOutcome::PolicyBlocked);
    assert_eq!(attempts[1].outcome, DownloadOutcome::PermanentFailure);
    assert_eq!(orchestrator.transport().calls(), vec![DownloadMethod::EnaFtp]);

    let paid_aws = [TransportMethod::AwsCp {
        credentials: Some(AwsCredentials {
            key_id: "AKIA".to_string(),
            secret: "secret".to_string(),
        }),
    }];
    let result = fetch(
        &orchestrator,
        &paid_aws,
        PaidPolicy::from_flags(false, true, false),
        false,
    )
    .unwrap();
    assert_eq!(result.method, DownloadMethod::AwsCp);
}

#[test]
fn sra_requirement_skips_ena_methods() {
    let transport = ScriptedTransport::with(vec![
        (DownloadMethod::EnaFtp, vec![Step::Deliver]),
        (DownloadMethod::AwsHttp, vec![Step::Deliver]),
    ]);
    let orchestrator = Orchestrator::new(FakeResolver::default(), transport);

    let result = fetch(
        &orchestrator,
        &[TransportMethod::EnaFtp, TransportMethod::AwsHttp],
        PaidPolicy::default(),
        true,
    )
    .unwrap();

    assert_eq!(result.attempts[0].method, DownloadMethod::EnaFtp);
    assert_eq!(result.attempts[0].outcome, DownloadOutcome::PermanentFailure);
    assert_eq!(result.attempts[0].tries, 0);
    assert_eq!(orchestrator.transport().calls(), vec![DownloadMethod::AwsHttp]);
}

#[test]
fn unresolvable_run_fails_method_without_transport() {
    let resolver = FakeResolver {
        missing: vec![Provider::AwsOpenData],
        ..FakeResolver::default()
    };
    let orchestrator = Orchestrator::new(resolver, ScriptedTransport::default());

    let err = fetch(
        &orchestrator,
        &[TransportMethod::AwsHttp],
        PaidPolicy::default(),
        false,
    )
    .unwrap_err();

    let KiraError::OrchestratorExhausted { attempts } = err else {
        panic!("expected exhausted orchestrator");
    };
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, DownloadOutcome::PermanentFailure);
    assert_eq!(attempts[0].tries, 1);
    assert!(orchestrator.transport().calls().is_empty());
}
