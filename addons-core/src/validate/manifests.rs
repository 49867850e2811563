//! Manifests applied by the validators, embedded at build time.

use super::Arch;

/// A manifest body and the name it is logged under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Manifest {
    pub name: &'static str,
    body: &'static str,
}

impl Manifest {
    const fn new(name: &'static str, body: &'static str) -> Self {
        Self { name, body }
    }

    pub fn body(&self) -> &'static str {
        self.body
    }

    /// Body with every `$ARCH` replaced by the image suffix of `arch`.
    pub fn render(&self, arch: &Arch) -> String {
        self.body.replace("$ARCH", arch.image_suffix())
    }
}

pub const PVC: Manifest = Manifest::new("pvc", include_str!("../../templates/pvc.yaml"));
pub const INGRESS: Manifest =
    Manifest::new("ingress", include_str!("../../templates/ingress.yaml"));
pub const CUDA_ADD: Manifest =
    Manifest::new("cuda-add", include_str!("../../templates/cuda-add.yaml"));
pub const BBOX_LOCAL: Manifest =
    Manifest::new("bbox-local", include_str!("../../templates/bbox-local.yaml"));
pub const NGINX_POD: Manifest =
    Manifest::new("nginx-pod", include_str!("../../templates/nginx-pod.yaml"));
pub const MAYASTOR_PVC: Manifest =
    Manifest::new("mayastor-pvc", include_str!("../../templates/mayastor-pvc.yaml"));
pub const REGISTRY_SC: Manifest =
    Manifest::new("registry-sc", include_str!("../../templates/registry-sc.yaml"));
pub const CERT_MANAGER: Manifest = Manifest::new(
    "cert-manager-aio-test",
    include_str!("../../templates/cert-manager-aio-test.yaml"),
);
