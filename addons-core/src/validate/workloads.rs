//! Validators that deploy a workload and check that it is served.

use std::{sync::LazyLock, time::Duration};

use regex::Regex;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{Verdict, ValidationContext, ensure, manifests};
use crate::{
    command::CommandSpec,
    error::{AddonError, Result},
    pods::PodSelector,
    poll::PollPolicy,
};

pub(super) const CUSTOM_REGISTRY_SIZE: &str = "25Gi";
pub(super) const CUSTOM_REGISTRY_CLASS: &str = "registry-test-sc";

const DASHBOARD_PROXY: &str =
    "/api/v1/namespaces/kube-system/services/https:kubernetes-dashboard:/proxy/";
const METRICS_PODS: &str = "/apis/metrics.k8s.io/v1beta1/pods";
const MICROBOT_HOST: &str = "microbot.127.0.0.1.nip.io";
const LOCAL_BUSYBOX: &str = "localhost:32000/my-busybox";

/// Registry claims must be at least 20Gi.
static REGISTRY_SIZE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([2-9]\d+|[1-9]\d{2,})Gi$")
        .unwrap_or_else(|err| panic!("bad regex: {err}"))
});

/// Poll `get pvc` until a claim is Bound. Exhaustion is tolerated; the
/// caller gets the last listing either way.
fn pvc_listing(ctx: &ValidationContext) -> Result<String> {
    let policy = PollPolicy::attempts(50, Duration::from_secs(2));
    let outcome = ctx.kubectl.wait_for_output(&["get", "pvc"], "Bound", policy)?;
    match outcome.ready() {
        Some(listing) => Ok(listing),
        None => ctx.kubectl.run(["get", "pvc"]),
    }
}

fn poll_raw(ctx: &ValidationContext, path: &str, needle: &str) -> Result<()> {
    // 30 tries, 10s apart
    let policy = PollPolicy::attempts(29, Duration::from_secs(10));
    ctx.kubectl
        .wait_for_output(&["get", "--raw", path], needle, policy)?
        .into_result(format!("{path} to serve {needle}"))
        .map(|_| ())
}

pub(super) fn dashboard(ctx: &ValidationContext) -> Result<Verdict> {
    for app in ["kubernetes-dashboard", "dashboard-metrics-scraper"] {
        ctx.wait_running(&PodSelector::labelled("kube-system", format!("k8s-app={app}")))?;
    }
    poll_raw(ctx, DASHBOARD_PROXY, "Kubernetes Dashboard")?;
    Ok(Verdict::Passed)
}

pub(super) fn storage(ctx: &ValidationContext) -> Result<Verdict> {
    let description = ctx
        .kubectl
        .run(["describe", "deployment", "hostpath-provisioner", "-n", "kube-system"])?;
    let stale = format!("hostpath-provisioner-{}:1.0.0", ctx.arch.image_suffix());
    if description.contains(&stale) {
        info!(image = %stale, "patching stale hostpath provisioner");
        ctx.kubectl.run([
            "set",
            "image",
            "deployment",
            "hostpath-provisioner",
            "-n",
            "kube-system",
            "hostpath-provisioner=cdkbot/hostpath-provisioner:1.1.0",
        ])?;
    }

    ctx.wait_running(&PodSelector::labelled("kube-system", "k8s-app=hostpath-provisioner"))?;
    let manifest = manifests::PVC.render(&ctx.arch);
    ctx.kubectl.apply_manifest(&manifest)?;
    ctx.wait_running(&PodSelector::named("default", "hostpath-test-pod"))?;

    let listing = pvc_listing(ctx)?;

    let wrote_data = WalkDir::new(&ctx.storage_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .any(|entry| entry.file_type().is_file() && entry.file_name() == "dates");
    ensure(wrote_data, || {
        format!("test pod wrote nothing under {}", ctx.storage_dir.display())
    })?;
    ensure(listing.contains("myclaim") && listing.contains("Bound"), || {
        format!("claim myclaim is not bound:\n{listing}")
    })?;

    ctx.kubectl.delete_manifest(&manifest)?;
    Ok(Verdict::Passed)
}

pub(super) fn ingress(ctx: &ValidationContext) -> Result<Verdict> {
    let daemonsets = ctx.kubectl.run(["get", "ds"])?;
    if daemonsets.contains("nginx-ingress-microk8s-controller") {
        ctx.wait_running(&PodSelector::labelled("default", "app=default-http-backend"))?;
        ctx.wait_running(&PodSelector::labelled("default", "name=nginx-ingress-microk8s"))?;
    } else {
        ctx.wait_running(&PodSelector::labelled("ingress", "name=nginx-ingress-microk8s"))?;
    }

    let manifest = manifests::INGRESS.render(&ctx.arch);
    ctx.kubectl.apply_manifest(&manifest)?;
    ctx.wait_running(&PodSelector::labelled("default", "app=microbot"))?;

    let every_5s = PollPolicy::attempts(50, Duration::from_secs(5));
    ctx.kubectl
        .wait_for_output(&["get", "ing"], MICROBOT_HOST, every_5s)?
        .into_result(format!("ingress rule for {MICROBOT_HOST}"))?;

    let url = &ctx.ingress_url;
    ctx.kubectl
        .poller(format!("{url} to serve microbot"), every_5s)
        .poll(|| ctx.http.check(url, 200, Some("microbot.png")))?
        .into_result(format!("{url} to serve microbot.png"))?;

    ctx.kubectl.delete_manifest(&manifest)?;
    Ok(Verdict::Passed)
}

pub(super) fn gpu(ctx: &ValidationContext) -> Result<Verdict> {
    if let Some(skip) = Verdict::x86_only(&ctx.arch, "GPU") {
        return Ok(skip);
    }
    ctx.wait_running(&PodSelector::labelled(
        "gpu-operator-resources",
        "app=nvidia-device-plugin-daemonset",
    ))?;

    let manifest = manifests::CUDA_ADD.render(&ctx.arch);
    if ctx.kubectl.run(["get", "po"])?.contains("cuda-vector-add") {
        debug!("removing leftover cuda-vector-add pod");
        ctx.kubectl.delete_manifest(&manifest)?;
        ctx.kubectl.clock().sleep(Duration::from_secs(10));
    }

    ctx.kubectl.apply_manifest(&manifest)?;
    ctx.kubectl.wait_for_pod_state(
        &PodSelector::named("default", "cuda-vector-add"),
        "terminated",
        None,
        ctx.pod_timeout,
    )?;
    let logs = ctx.kubectl.run(["logs", "pod/cuda-vector-add"])?;
    ensure(logs.contains("PASSED"), || format!("cuda-vector-add did not pass:\n{logs}"))?;
    Ok(Verdict::Passed)
}

fn registry_claim(ctx: &ValidationContext) -> Result<(String, Option<String>)> {
    let pvc = ctx
        .kubectl
        .get_yaml(&["get", "pvc", "registry-claim", "-n", "container-registry"])?;
    let spec = &pvc["spec"];
    let storage = spec["resources"]["requests"]["storage"]
        .as_str()
        .ok_or_else(|| {
            AddonError::malformed(
                "yaml",
                "registry-claim",
                "missing spec.resources.requests.storage",
            )
        })?
        .to_string();
    let class = spec["storageClassName"].as_str().map(str::to_string);
    Ok((storage, class))
}

fn docker(ctx: &ValidationContext, args: &[&str]) -> Result<String> {
    let spec = CommandSpec::new(ctx.docker.display().to_string()).args(args.iter().copied());
    ctx.kubectl.runner().run(&spec)?.into_stdout(&spec)
}

pub(super) fn registry(ctx: &ValidationContext) -> Result<Verdict> {
    ctx.wait_running(&PodSelector::labelled("container-registry", "app=registry"))?;
    let (storage, _) = registry_claim(ctx)?;
    ensure(REGISTRY_SIZE.is_match(&storage), || {
        format!("registry claim requests {storage}, expected at least 20Gi")
    })?;

    docker(ctx, &["pull", "busybox"])?;
    docker(ctx, &["tag", "busybox", LOCAL_BUSYBOX])?;
    docker(ctx, &["push", LOCAL_BUSYBOX])?;

    let manifest = manifests::BBOX_LOCAL.render(&ctx.arch);
    ctx.kubectl.apply_manifest(&manifest)?;
    ctx.wait_running(&PodSelector::named("default", "busybox"))?;
    let description = ctx.kubectl.run(["describe", "po", "busybox"])?;
    ensure(description.contains(LOCAL_BUSYBOX), || {
        format!("busybox pod is not using {LOCAL_BUSYBOX}")
    })?;
    ctx.kubectl.delete_manifest(&manifest)?;
    Ok(Verdict::Passed)
}

pub(super) fn registry_custom(
    ctx: &ValidationContext,
    size: &str,
    storage_class: &str,
) -> Result<Verdict> {
    ctx.wait_running(&PodSelector::labelled("container-registry", "app=registry"))?;
    let (storage, class) = registry_claim(ctx)?;
    ensure(storage == size, || {
        format!("registry claim requests {storage}, expected {size}")
    })?;
    ensure(class.as_deref() == Some(storage_class), || {
        format!("registry claim uses storage class {class:?}, expected {storage_class}")
    })?;
    Ok(Verdict::Passed)
}

pub(super) fn forward(ctx: &ValidationContext) -> Result<Verdict> {
    ctx.kubectl.apply_manifest(manifests::NGINX_POD.body())?;
    ctx.wait_running(&PodSelector::labelled("default", "app=nginx"))?;

    let port = ctx.forward_port;
    let _forward = ctx.kubectl.port_forward("default", "pod/nginx", port, 80)?;
    let url = format!("http://127.0.0.1:{port}/");
    let policy = PollPolicy::attempts(10, Duration::from_secs(2));
    ctx.kubectl
        .poller(format!("{url} via port-forward"), policy)
        .poll(|| ctx.http.check(&url, 200, None))?
        .into_last_error(format!("{url} to answer 200"))?;
    Ok(Verdict::Passed)
}

pub(super) fn metrics_server(ctx: &ValidationContext) -> Result<Verdict> {
    ctx.wait_running(&PodSelector::labelled("kube-system", "k8s-app=metrics-server"))?;
    poll_raw(ctx, METRICS_PODS, "PodMetricsList")?;
    Ok(Verdict::Passed)
}

pub(super) fn mayastor(ctx: &ValidationContext) -> Result<Verdict> {
    ctx.wait_running(&PodSelector::labelled("mayastor", "app=mayastor"))?;
    let manifest = manifests::MAYASTOR_PVC.render(&ctx.arch);
    ctx.kubectl.apply_manifest(&manifest)?;
    ctx.wait_running(&PodSelector::named("default", "mayastor-test-pod"))?;
    let listing = pvc_listing(ctx)?;
    debug!(%listing, "mayastor claims");
    ctx.kubectl.delete_manifest(&manifest)?;
    Ok(Verdict::Passed)
}
