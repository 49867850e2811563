//! Validators for cluster-wide configuration and control-plane addons.

use std::{fs, io, time::Duration};

use tracing::info;

use super::{Verdict, ValidationContext, ensure, manifests};
use crate::{
    error::{AddonError, Result},
    kubectl::retry_for,
    pods::PodSelector,
    poll::{Check, PollPolicy},
};

pub(super) const DEFAULT_METALLB_RANGES: &str = "192.168.0.105";
pub(super) const DEFAULT_DNS_SERVERS: &str = "8.8.8.8,1.1.1.1";

const MONITORING_TIMEOUT: Duration = Duration::from_secs(1200);
const CAN_I_TIMEOUT: Duration = Duration::from_secs(60);

pub(super) fn prometheus(ctx: &ValidationContext) -> Result<Verdict> {
    if let Some(skip) = Verdict::x86_only(&ctx.arch, "Prometheus") {
        return Ok(skip);
    }
    for pod in ["prometheus-k8s-0", "alertmanager-main-0"] {
        ctx.wait_running_for(&PodSelector::named("monitoring", pod), MONITORING_TIMEOUT)?;
    }
    Ok(Verdict::Passed)
}

pub(super) fn observability(ctx: &ValidationContext) -> Result<Verdict> {
    if let Some(skip) = Verdict::x86_only(&ctx.arch, "Observability") {
        return Ok(skip);
    }
    let selectors = [
        PodSelector::named(
            "observability",
            "prometheus-kube-prom-stack-kube-prome-prometheus-0",
        ),
        PodSelector::named(
            "observability",
            "alertmanager-kube-prom-stack-kube-prome-alertmanager-0",
        ),
        PodSelector::labelled("observability", "app.kubernetes.io/name=grafana"),
        PodSelector::named("observability", "loki-0"),
    ];
    for selector in &selectors {
        ctx.wait_running_for(selector, MONITORING_TIMEOUT)?;
    }
    Ok(Verdict::Passed)
}

pub(super) fn rbac(ctx: &ValidationContext) -> Result<Verdict> {
    let policy = retry_for(CAN_I_TIMEOUT);
    let sa = "system:serviceaccount:default:default";
    let allowed = ctx.kubectl.can_i("view", "pod", sa, &[], policy)?;
    ensure(!allowed, || "default service account may view pods".to_string())?;

    let allowed = ctx
        .kubectl
        .can_i("view", "pod", "admin", &["system:masters"], policy)?;
    ensure(allowed, || "system:masters may not view pods".to_string())?;
    Ok(Verdict::Passed)
}

pub(super) fn metallb_config(ctx: &ValidationContext, ip_ranges: &str) -> Result<Verdict> {
    if let Some(skip) = Verdict::x86_only(&ctx.arch, "Metallb") {
        return Ok(skip);
    }
    let config = ctx.kubectl.jsonpath(
        &["get", "configmap", "config", "-n", "metallb-system"],
        "{.data.config}",
    )?;
    for range in ip_ranges.split(',').map(str::trim).filter(|r| !r.is_empty()) {
        ensure(config.contains(range), || {
            format!("metallb config does not contain {range}")
        })?;
    }
    Ok(Verdict::Passed)
}

/// `forward . A B …` for the comma-separated servers.
pub(super) fn expected_forward(servers: &str) -> String {
    servers
        .split(',')
        .map(str::trim)
        .filter(|server| !server.is_empty())
        .fold(String::from("forward ."), |mut line, server| {
            line.push(' ');
            line.push_str(server);
            line
        })
}

pub(super) fn coredns_config(ctx: &ValidationContext, servers: &str) -> Result<Verdict> {
    let corefile = ctx.kubectl.jsonpath(
        &["get", "configmap", "coredns", "-n", "kube-system"],
        "{.data.Corefile}",
    )?;
    let expected = expected_forward(servers);
    ensure(corefile.contains(&expected), || {
        format!("Corefile has no `{expected}` line")
    })?;
    Ok(Verdict::Passed)
}

pub(super) fn cert_manager(ctx: &ValidationContext) -> Result<Verdict> {
    for app in ["cert-manager", "cainjector", "webhook"] {
        ctx.wait_running(&PodSelector::labelled("cert-manager", format!("app={app}")))?;
    }

    let manifest = manifests::CERT_MANAGER.body();
    // the webhook may still refuse requests right after its pod starts
    ctx.kubectl
        .poller("cert-manager webhook", retry_for(Duration::from_secs(120)))
        .poll(|| ctx.kubectl.apply_manifest(manifest).map(Check::Ready))?
        .into_last_error("cert-manager resources to apply")?;

    let ready = r#"{.status.conditions[?(@.type=="Ready")].status}"#;
    let certificate = ["get", "certificate", "cm-test-cert", "-n", "default"];
    ctx.kubectl
        .poller(
            "certificate cm-test-cert",
            PollPolicy::attempts(60, Duration::from_secs(5)),
        )
        .poll(|| {
            let status = ctx.kubectl.jsonpath(&certificate, ready)?;
            Ok(Check::from(status.trim() == "True"))
        })?
        .into_result("certificate cm-test-cert to be Ready")?;

    ctx.kubectl.delete_manifest(manifest)?;
    Ok(Verdict::Passed)
}

pub(super) fn backup_restore(ctx: &ValidationContext) -> Result<Verdict> {
    let output = ctx.work_dir.join("backupfile");
    let stale = ctx.work_dir.join("backupfile.tar.gz");
    match fs::remove_file(&stale) {
        Ok(()) => info!(path = %stale.display(), "removed previous backup"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(AddonError::io(stale, err)),
    }
    let archive = ctx.dbctl.backup(&output)?;
    ctx.dbctl.restore(&archive)?;
    Ok(Verdict::Passed)
}
