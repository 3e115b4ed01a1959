//! Benchmark scenarios.
//!
//! A scenario run is a fixed sequence of [`Phase`]s. Each phase is pursued by
//! acting on the cluster and then waiting for the operators to catch up; the
//! first phase that can't be reached fails the run, and the error says which
//! one it was.
//!
//! Scenarios come in two suites:
//!
//! - the pausable datacenter suite. `prewarmed` and `cold` write data to a
//!   pausable datacenter, pause it, and measure how long a single CQL
//!   connection attempt takes to go through. The connection itself is what
//!   resumes the datacenter. `baseline` deletes a plainly deployed datacenter,
//!   keeps its volumes, and measures how long re-creating it takes until it's
//!   available. In all three the time the database spent starting up is
//!   recovered from the members' logs and subtracted from the measured
//!   interval.
//! - the proxy volume suite (`pod_baseline`, `busywait`, `sidecar`), which
//!   measures how long a pod takes to become ready once its storage is
//!   available. See [`proxy_volume`].

use std::fmt::Debug;
use std::time::Duration;

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use kube::{Resource, ResourceExt};
use serde_json::json;
use strum_macros::{Display, EnumString, VariantNames};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utils::wait::{
    ConditionFn, WaitForStateOptions, wait_for_object_deletion, wait_for_object_state,
};

use crate::attachment::AttachmentKey;
use crate::cluster::{Cluster, DeletePropagation, LogSource, ResourceClient, get_required};
use crate::config::{BenchmarkConfig, ConfigError};
use crate::cql::{ConnectionBundle, CqlEndpoint, CqlSession, SessionFactory, TestData};
use crate::crd::{PausableScyllaDBDatacenter, ScyllaDBDatacenter, ScyllaDBDatacenterPool};
use crate::manifests::{self, VolumeBindingMode};
use crate::naming::{
    SCYLLA_CONTAINER_NAME, backend_pvc_name_for_member, claim_name_for_pausable_datacenter,
    keyspace_for_namespace, local_cql_connection_configs_name, member_pod_name,
    public_dns_domain, pvc_name_for_pod,
};
use crate::predicates;
use crate::startup_logs::{StartupMarkers, group_startup_duration, member_startup_duration};
use crate::timing::{ReadinessRecord, ResultSink, RunRecord, TimingRecord};

mod proxy_volume;

/// Results of the proxy volume suite go to this subdirectory of `dest_dir`,
/// so that its `baseline` doesn't mix with the datacenter one.
pub const PROXY_VOLUME_RESULTS_DIR: &str = "proxy-volume";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, VariantNames, clap::ValueEnum,
)]
#[strum(serialize_all = "snake_case")]
pub enum Scenario {
    /// Resume a pausable datacenter whose pool keeps a datacenter ready.
    Prewarmed,
    /// Resume a pausable datacenter whose pool is empty.
    Cold,
    /// Re-create a plain datacenter on its retained volumes.
    Baseline,
    /// Start a pod on a backend volume from scratch.
    PodBaseline,
    /// Put a backend volume behind the proxy volume of a running pod that
    /// keeps retrying its first write.
    Busywait,
    /// Like busywait, with the proxy CSI driver's sidecar signalling when the
    /// backend volume is mounted.
    Sidecar,
}

/// Scenarios sharing their setup and their results layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suite {
    PausableDatacenter,
    ProxyVolume,
}

impl Scenario {
    pub const ALL: [Scenario; 6] = [
        Scenario::Prewarmed,
        Scenario::Cold,
        Scenario::Baseline,
        Scenario::PodBaseline,
        Scenario::Busywait,
        Scenario::Sidecar,
    ];

    pub fn suite(&self) -> Suite {
        match self {
            Scenario::Prewarmed | Scenario::Cold | Scenario::Baseline => Suite::PausableDatacenter,
            Scenario::PodBaseline | Scenario::Busywait | Scenario::Sidecar => Suite::ProxyVolume,
        }
    }

    /// File the results of each run are appended to.
    pub fn results_path(&self, dest_dir: &Utf8Path) -> Utf8PathBuf {
        let file_name = match self {
            Scenario::Prewarmed => "prewarmed",
            Scenario::Cold => "cold",
            Scenario::Baseline | Scenario::PodBaseline => "baseline",
            Scenario::Busywait => "busywait",
            Scenario::Sidecar => "sidecar",
        };
        match self.suite() {
            Suite::PausableDatacenter => dest_dir.join(file_name),
            Suite::ProxyVolume => dest_dir.join(PROXY_VOLUME_RESULTS_DIR).join(file_name),
        }
    }

    /// Capacity and limit of the pool, for pause scenarios.
    fn pool_size(&self) -> Option<(i32, i32)> {
        match self {
            Scenario::Prewarmed => Some((1, 1)),
            Scenario::Cold => Some((0, 0)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Phase {
    Provisioning,
    PoolReady,
    DatacenterReady,
    DataVerified,
    Paused,
    BackendDetached,
    PoolReadyAfterPause,
    Reconnected,
    DatacenterReverified,
    DatacenterDeleted,
    VolumesRetained,
    Redeployed,
    DatacenterAvailable,
    BackendVolumeBound,
    PodRunning,
    PodReady,
    ApplicationTimeExtracted,
    Recorded,
}

#[derive(Debug, thiserror::Error)]
#[error("scenario {scenario} failed while pursuing phase {phase}")]
pub struct ScenarioError {
    pub scenario: Scenario,
    pub phase: Phase,
    #[source]
    pub source: anyhow::Error,
}

/// Progress of one run.
struct ScenarioRun {
    scenario: Scenario,
    phase: Phase,
    started_at: Instant,
    reached: Vec<(Phase, Instant)>,
}

impl ScenarioRun {
    fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            phase: Phase::Provisioning,
            started_at: Instant::now(),
            reached: Vec::new(),
        }
    }

    /// Marks the current phase as reached and moves on to `next`.
    fn pursue(&mut self, next: Phase) {
        if next != self.phase {
            self.reached();
        }
        info!(scenario = %self.scenario, phase = %next, "pursuing phase");
        self.phase = next;
    }

    fn reached(&mut self) {
        let now = Instant::now();
        debug!(
            scenario = %self.scenario,
            phase = %self.phase,
            after = ?now - self.started_at,
            "phase reached"
        );
        self.reached.push((self.phase, now));
    }

    fn fail(&self, source: anyhow::Error) -> ScenarioError {
        ScenarioError {
            scenario: self.scenario,
            phase: self.phase,
            source,
        }
    }
}

/// What a scenario measured.
enum Measurement {
    /// Includes the database starting up, which is yet to be subtracted.
    Datacenter(Measured),
    /// Time until a pod became ready.
    PodReadiness(Duration),
}

/// What a datacenter scenario measured, before the database's share is known.
struct Measured {
    elapsed: Duration,
    namespace: String,
    members: Vec<Member>,
}

/// A member of the datacenter, by rack and ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Member {
    rack: String,
    ordinal: u32,
    pod: String,
}

/// VolumeAttachment observed before tearing a datacenter down.
#[derive(Debug, Clone)]
struct AttachedVolume {
    name: String,
    uid: String,
}

/// Objects a run created outside of its namespace, plus the namespace itself.
#[derive(Debug, Default)]
struct CreatedObjects {
    namespace: Option<String>,
    storage_class: Option<String>,
}

pub struct Orchestrator<C, S> {
    cluster: C,
    sessions: S,
    config: BenchmarkConfig,
    wait_options: WaitForStateOptions,
    markers: StartupMarkers,
}

impl<C, S> Orchestrator<C, S>
where
    C: Cluster,
    S: SessionFactory,
{
    pub fn new(cluster: C, sessions: S, config: BenchmarkConfig) -> Result<Self, ConfigError> {
        let wait_options = config.wait.options()?;
        Ok(Self {
            cluster,
            sessions,
            config,
            wait_options,
            markers: StartupMarkers::default(),
        })
    }

    pub fn with_markers(mut self, markers: StartupMarkers) -> Self {
        self.markers = markers;
        self
    }

    /// Runs `scenario` once in a fresh namespace and appends the result to
    /// `sink`. Whatever the run created is deleted afterwards, whether it
    /// succeeded or not.
    pub async fn run(
        &self,
        scenario: Scenario,
        sink: &mut dyn ResultSink,
        cancel: &CancellationToken,
    ) -> Result<RunRecord, ScenarioError> {
        let mut run = ScenarioRun::new(scenario);
        let mut created = CreatedObjects::default();

        let measurement = match (scenario, scenario.pool_size()) {
            (_, Some((capacity, limit))) => self
                .run_pausable(&mut run, &mut created, capacity, limit, cancel)
                .await
                .map(Measurement::Datacenter),
            (Scenario::Baseline, None) => self
                .run_baseline(&mut run, &mut created, cancel)
                .await
                .map(Measurement::Datacenter),
            (_, None) => self
                .run_proxy_volume(&mut run, &mut created, cancel)
                .await
                .map(Measurement::PodReadiness),
        };
        let result = match measurement {
            Ok(measurement) => self.record(&mut run, measurement, sink).await,
            Err(e) => Err(e),
        };

        self.cleanup(created).await;

        match result {
            Ok(record) => {
                run.reached();
                match record.decomposed() {
                    Some(decomposed) => info!(
                        %scenario,
                        elapsed_time_ms = decomposed.elapsed_time_ms,
                        application_time_ms = decomposed.application_time_ms,
                        overhead_time_ms = decomposed.overhead_time_ms,
                        "scenario finished"
                    ),
                    None => info!(
                        %scenario,
                        elapsed_time_ms = record.elapsed_time_ms(),
                        "scenario finished"
                    ),
                }
                Ok(record)
            }
            Err(e) => Err(run.fail(e)),
        }
    }

    async fn record(
        &self,
        run: &mut ScenarioRun,
        measurement: Measurement,
        sink: &mut dyn ResultSink,
    ) -> anyhow::Result<RunRecord> {
        let record = match measurement {
            Measurement::Datacenter(measured) => {
                run.pursue(Phase::ApplicationTimeExtracted);
                let pods: Vec<String> = measured.members.into_iter().map(|m| m.pod).collect();
                let application = application_startup_time(
                    &*self.cluster.logs(),
                    &self.markers,
                    &measured.namespace,
                    &pods,
                )
                .await?;
                RunRecord::from(TimingRecord::decompose(measured.elapsed, application))
            }
            Measurement::PodReadiness(elapsed) => RunRecord::from(ReadinessRecord::new(elapsed)),
        };
        run.pursue(Phase::Recorded);
        sink.append(&record)?;
        Ok(record)
    }

    async fn run_pausable(
        &self,
        run: &mut ScenarioRun,
        created: &mut CreatedObjects,
        capacity: i32,
        limit: i32,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Measured> {
        run.pursue(Phase::Provisioning);
        let namespace = self.create_namespace(created).await?;
        let storage_class = self
            .create_storage_class(VolumeBindingMode::Immediate, created)
            .await?;
        let pools = self.cluster.datacenter_pools(&namespace);
        let pool = pools
            .create(&manifests::datacenter_pool(
                &self.config,
                &storage_class,
                capacity,
                limit,
            ))
            .await?;
        let pool_name = pool.name_any();
        let psdcs = self.cluster.pausable_datacenters(&namespace);
        let psdc = psdcs
            .create(&manifests::pausable_datacenter(
                &pool_name,
                &self.config.ingress_class_name,
            ))
            .await?;
        let psdc_name = psdc.name_any();

        run.pursue(Phase::PoolReady);
        self.wait_state(
            &*pools,
            &pool_name,
            cancel,
            &predicates::is_rolled_out::<ScyllaDBDatacenterPool>,
        )
        .await?;

        run.pursue(Phase::DatacenterReady);
        let sdc = self
            .bound_datacenter(&namespace, &psdc_name, cancel)
            .await?;

        run.pursue(Phase::DataVerified);
        let data = TestData::new(
            &keyspace_for_namespace(&namespace),
            self.config.nodes,
            self.config.cql.test_rows,
        );
        // The connection config of the first datacenter keeps working across
        // pauses: it names the pausable datacenter's domain.
        let endpoint = self.cql_endpoint(&namespace, &sdc, cancel).await?;
        let session = self.open_session(&endpoint, cancel).await?;
        session.insert_test_data(&data).await?;
        session.verify_test_data(&data).await?;
        session.close();

        run.pursue(Phase::Paused);
        let members = datacenter_members(&sdc)?;
        let attachments = self
            .snapshot_attachments(
                &namespace,
                &members,
                |m| backend_pvc_name_for_member(&psdc_name, &m.rack, m.ordinal),
                cancel,
            )
            .await?;
        psdcs
            .patch(&psdc_name, &json!({"spec": {"paused": true}}))
            .await?;
        self.wait_state(
            &*psdcs,
            &psdc_name,
            cancel,
            &predicates::is_rolled_out::<PausableScyllaDBDatacenter>,
        )
        .await?;
        let sdcs = self.cluster.datacenters(&namespace);
        self.wait_deleted(&*sdcs, &sdc.name_any(), &uid_of(&sdc)?, cancel)
            .await?;

        run.pursue(Phase::BackendDetached);
        let pvcs = self.cluster.persistent_volume_claims(&namespace);
        for member in &members {
            self.wait_state(
                &*pvcs,
                &backend_pvc_name_for_member(&psdc_name, &member.rack, member.ordinal),
                cancel,
                &predicates::is_backend_pvc_unbound_from_proxy_pvc,
            )
            .await?;
        }
        self.wait_detached(&attachments, cancel).await?;

        run.pursue(Phase::PoolReadyAfterPause);
        self.wait_state(
            &*pools,
            &pool_name,
            cancel,
            &predicates::is_rolled_out::<ScyllaDBDatacenterPool>,
        )
        .await?;

        run.pursue(Phase::Reconnected);
        let start = Instant::now();
        let session = self.connect(&endpoint, cancel).await?;
        let elapsed = start.elapsed();
        info!(elapsed = %humantime::format_duration(elapsed), "reconnected to the paused datacenter");
        session.verify_test_data(&data).await?;
        session.close();

        run.pursue(Phase::DatacenterReverified);
        let sdc = self
            .bound_datacenter(&namespace, &psdc_name, cancel)
            .await?;
        let members = datacenter_members(&sdc)?;
        self.wait_members_ready(&namespace, &members, cancel).await?;

        Ok(Measured {
            elapsed,
            namespace,
            members,
        })
    }

    async fn run_baseline(
        &self,
        run: &mut ScenarioRun,
        created: &mut CreatedObjects,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Measured> {
        run.pursue(Phase::Provisioning);
        let namespace = self.create_namespace(created).await?;
        let storage_class = self
            .create_storage_class(VolumeBindingMode::WaitForFirstConsumer, created)
            .await?;
        let dns_domain = public_dns_domain(&namespace);
        let sdcs = self.cluster.datacenters(&namespace);
        let sdc = sdcs
            .create(&manifests::plain_datacenter(
                &self.config,
                &storage_class,
                &dns_domain,
            ))
            .await?;
        let sdc_name = sdc.name_any();

        run.pursue(Phase::DatacenterReady);
        let sdc = self
            .wait_state(
                &*sdcs,
                &sdc_name,
                cancel,
                &predicates::is_rolled_out::<ScyllaDBDatacenter>,
            )
            .await?;

        run.pursue(Phase::DataVerified);
        let data = TestData::new(
            &keyspace_for_namespace(&namespace),
            self.config.nodes,
            self.config.cql.test_rows,
        );
        let endpoint = self.cql_endpoint(&namespace, &sdc, cancel).await?;
        let session = self.open_session(&endpoint, cancel).await?;
        session.insert_test_data(&data).await?;
        session.verify_test_data(&data).await?;
        session.close();

        run.pursue(Phase::DatacenterDeleted);
        let members = datacenter_members(&sdc)?;
        let attachments = self
            .snapshot_attachments(&namespace, &members, |m| pvc_name_for_pod(&m.pod), cancel)
            .await?;
        let uid = uid_of(&sdc)?;
        sdcs.delete(&sdc_name, Some(&uid), DeletePropagation::Foreground)
            .await?;
        self.wait_deleted(&*sdcs, &sdc_name, &uid, cancel).await?;

        run.pursue(Phase::BackendDetached);
        self.wait_detached(&attachments, cancel).await?;

        run.pursue(Phase::VolumesRetained);
        self.check_volumes_retained(&namespace, &members).await?;

        run.pursue(Phase::Redeployed);
        let start = Instant::now();
        sdcs.create(&manifests::plain_datacenter(
            &self.config,
            &storage_class,
            &dns_domain,
        ))
        .await?;

        run.pursue(Phase::DatacenterAvailable);
        let sdc = self
            .wait_state(
                &*sdcs,
                &sdc_name,
                cancel,
                &predicates::is_available::<ScyllaDBDatacenter>,
            )
            .await?;
        let elapsed = start.elapsed();
        info!(elapsed = %humantime::format_duration(elapsed), "datacenter available again");

        run.pursue(Phase::Reconnected);
        // The operator republishes the connection config with the datacenter.
        let endpoint = self.cql_endpoint(&namespace, &sdc, cancel).await?;
        let session = self.open_session(&endpoint, cancel).await?;
        session.verify_test_data(&data).await?;
        session.close();
        let members = datacenter_members(&sdc)?;
        self.wait_members_ready(&namespace, &members, cancel).await?;

        Ok(Measured {
            elapsed,
            namespace,
            members,
        })
    }

    async fn create_namespace(&self, created: &mut CreatedObjects) -> anyhow::Result<String> {
        let namespace = self
            .cluster
            .namespaces()
            .create(&manifests::benchmark_namespace())
            .await?
            .name_any();
        info!(%namespace, "created namespace");
        created.namespace = Some(namespace.clone());
        Ok(namespace)
    }

    async fn create_storage_class(
        &self,
        binding: VolumeBindingMode,
        created: &mut CreatedObjects,
    ) -> anyhow::Result<String> {
        let name = self
            .cluster
            .storage_classes()
            .create(&manifests::backend_storage_class(
                self.config.backend_csi_driver,
                binding,
            ))
            .await?
            .name_any();
        created.storage_class = Some(name.clone());
        Ok(name)
    }

    /// Cleanup failures are logged; they don't fail the run.
    async fn cleanup(&self, created: CreatedObjects) {
        if let Some(namespace) = created.namespace {
            if let Err(e) = self
                .cluster
                .namespaces()
                .delete(&namespace, None, DeletePropagation::Background)
                .await
            {
                warn!(%namespace, "failed to delete namespace: {e:#}");
            }
        }
        if let Some(storage_class) = created.storage_class {
            if let Err(e) = self
                .cluster
                .storage_classes()
                .delete(&storage_class, None, DeletePropagation::Background)
                .await
            {
                warn!(%storage_class, "failed to delete storage class: {e:#}");
            }
        }
    }

    /// Waits for the pausable datacenter to roll out and returns the
    /// datacenter currently bound to it.
    async fn bound_datacenter(
        &self,
        namespace: &str,
        psdc_name: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ScyllaDBDatacenter> {
        self.wait_state(
            &*self.cluster.pausable_datacenters(namespace),
            psdc_name,
            cancel,
            &predicates::is_rolled_out::<PausableScyllaDBDatacenter>,
        )
        .await?;
        let claim_name = claim_name_for_pausable_datacenter(psdc_name);
        let claim = get_required(&*self.cluster.datacenter_claims(namespace), &claim_name).await?;
        let sdc_name = claim
            .status
            .and_then(|status| status.scylla_db_datacenter_name)
            .filter(|name| !name.is_empty())
            .with_context(|| format!("claim {claim_name:?} is not bound to a datacenter"))?;
        let sdc = get_required(&*self.cluster.datacenters(namespace), &sdc_name).await?;
        let dns_domain = single_dns_domain(&sdc)?;
        info!(datacenter = %sdc_name, %dns_domain, "datacenter bound");
        Ok(sdc)
    }

    /// Derives the VolumeAttachment of every member's volume and waits for
    /// each to report attached. `pvc_name` names the PVC backing a member.
    async fn snapshot_attachments(
        &self,
        namespace: &str,
        members: &[Member],
        pvc_name: impl Fn(&Member) -> String,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<AttachedVolume>> {
        let pods = self.cluster.pods(namespace);
        let pvcs = self.cluster.persistent_volume_claims(namespace);
        let pvs = self.cluster.persistent_volumes();
        let vas = self.cluster.volume_attachments();

        let mut attachments = Vec::with_capacity(members.len());
        for member in members {
            let pod = get_required(&*pods, &member.pod).await?;
            let node_name = pod
                .spec
                .and_then(|spec| spec.node_name)
                .with_context(|| format!("pod {:?} is not scheduled", member.pod))?;

            let pvc_name = pvc_name(member);
            let pvc = get_required(&*pvcs, &pvc_name).await?;
            let volume_name = bound_volume_name(&pvc)
                .with_context(|| format!("PersistentVolumeClaim {pvc_name:?} is not bound"))?;

            let pv = get_required(&*pvs, &volume_name).await?;
            let csi = pv
                .spec
                .and_then(|spec| spec.csi)
                .with_context(|| format!("PersistentVolume {volume_name:?} is not a CSI volume"))?;
            if csi.driver != self.config.backend_csi_driver.name() {
                warn!(
                    volume = %volume_name,
                    driver = %csi.driver,
                    "volume is not provisioned by the configured backend driver"
                );
            }

            let name = AttachmentKey {
                volume_handle: csi.volume_handle,
                driver_name: csi.driver,
                node_name,
            }
            .attachment_name();
            let va = self
                .wait_state(&*vas, &name, cancel, &predicates::is_volume_attached)
                .await?;
            debug!(pod = %member.pod, attachment = %name, "volume attached");
            attachments.push(AttachedVolume {
                uid: uid_of(&va)?,
                name,
            });
        }
        Ok(attachments)
    }

    async fn wait_detached(
        &self,
        attachments: &[AttachedVolume],
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let vas = self.cluster.volume_attachments();
        for AttachedVolume { name, uid } in attachments {
            self.wait_deleted(&*vas, name, uid, cancel).await?;
        }
        Ok(())
    }

    /// The PVCs and their volumes must have survived the datacenter.
    async fn check_volumes_retained(
        &self,
        namespace: &str,
        members: &[Member],
    ) -> anyhow::Result<()> {
        let pvcs = self.cluster.persistent_volume_claims(namespace);
        let pvs = self.cluster.persistent_volumes();
        for member in members {
            let pvc_name = pvc_name_for_pod(&member.pod);
            let pvc = get_required(&*pvcs, &pvc_name).await?;
            if pvc.metadata.deletion_timestamp.is_some() {
                bail!("PersistentVolumeClaim {pvc_name:?} is being deleted");
            }
            let volume_name = bound_volume_name(&pvc)
                .with_context(|| format!("PersistentVolumeClaim {pvc_name:?} is not bound"))?;
            let pv = get_required(&*pvs, &volume_name).await?;
            if pv.metadata.deletion_timestamp.is_some() {
                bail!("PersistentVolume {volume_name:?} is being deleted");
            }
        }
        Ok(())
    }

    async fn wait_members_ready(
        &self,
        namespace: &str,
        members: &[Member],
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let pods = self.cluster.pods(namespace);
        for member in members {
            self.wait_state(
                &*pods,
                &member.pod,
                cancel,
                &predicates::is_pod_running_and_ready,
            )
            .await?;
        }
        Ok(())
    }

    /// Reads the connection config Scylla Operator published for `sdc` under
    /// its DNS domain and sends its connections through the ingress
    /// controller.
    async fn cql_endpoint(
        &self,
        namespace: &str,
        sdc: &ScyllaDBDatacenter,
        cancel: &CancellationToken,
    ) -> anyhow::Result<CqlEndpoint> {
        let dns_domain = single_dns_domain(sdc)?;
        let secret_name = local_cql_connection_configs_name(&sdc.name_any());
        let has_config = |secret: &Secret| {
            Ok(secret
                .data
                .as_ref()
                .is_some_and(|data| data.contains_key(dns_domain)))
        };
        let secret = self
            .wait_state(
                &*self.cluster.secrets(namespace),
                &secret_name,
                cancel,
                &has_config,
            )
            .await?;
        let config = secret
            .data
            .and_then(|mut data| data.remove(dns_domain))
            .with_context(|| format!("secret {secret_name:?} has no config for {dns_domain:?}"))?;
        let mut bundle = ConnectionBundle::parse(&config.0)
            .with_context(|| format!("read config for {dns_domain:?} from secret {secret_name:?}"))?;
        let datacenter = sdc.gossip_datacenter_name().to_string();
        bundle.route_through(&datacenter, &self.config.ingress_controller_address)?;
        Ok(CqlEndpoint {
            bundle,
            datacenter,
            connect_timeout: self.config.cql.connect_timeout,
        })
    }

    /// A single connection attempt.
    async fn connect(
        &self,
        endpoint: &CqlEndpoint,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Box<dyn CqlSession>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                bail!("cancelled while connecting through {}", endpoint.server())
            }
            opened = self.sessions.open(endpoint) => opened,
        }
    }

    /// Connects, retrying until the wait timeout. Returns as soon as a session
    /// is established.
    async fn open_session(
        &self,
        endpoint: &CqlEndpoint,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Box<dyn CqlSession>> {
        let deadline = Instant::now() + self.wait_options.timeout();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let e = match self.connect(endpoint, cancel).await {
                Ok(session) => return Ok(session),
                Err(e) if cancel.is_cancelled() => return Err(e),
                Err(e) => e,
            };
            if Instant::now() >= deadline {
                return Err(e.context(format!(
                    "no CQL session after {attempt} attempts within {}",
                    humantime::format_duration(self.wait_options.timeout())
                )));
            }
            warn!(attempt, "failed to connect through {}: {e:#}", endpoint.server());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    bail!("cancelled while connecting through {}", endpoint.server())
                }
                _ = tokio::time::sleep(self.wait_options.poll_interval()) => {}
            }
        }
    }

    async fn wait_state<K>(
        &self,
        client: &dyn ResourceClient<K>,
        name: &str,
        cancel: &CancellationToken,
        condition: &ConditionFn<'_, K>,
    ) -> anyhow::Result<K>
    where
        K: Clone + Debug + Send + Sync + 'static,
    {
        Ok(wait_for_object_state(client, name, &self.wait_options, cancel, condition, &[]).await?)
    }

    /// Waits until the object with `uid` is gone from `name`.
    async fn wait_deleted<K>(
        &self,
        client: &dyn ResourceClient<K>,
        name: &str,
        uid: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>
    where
        K: Resource + Clone + Debug + Send + Sync + 'static,
    {
        let is_same_object = |obj: &K| obj.meta().uid.as_deref() == Some(uid);
        wait_for_object_deletion(client, name, &self.wait_options, cancel, &is_same_object).await?;
        Ok(())
    }
}

/// Time the slowest member spent between starting the database process and
/// serving CQL. Members are read concurrently.
pub async fn application_startup_time(
    logs: &dyn LogSource,
    markers: &StartupMarkers,
    namespace: &str,
    pods: &[String],
) -> anyhow::Result<Duration> {
    let durations = try_join_all(pods.iter().map(|pod| async move {
        let output = logs
            .container_logs(namespace, pod, SCYLLA_CONTAINER_NAME)
            .await?;
        let duration = member_startup_duration(markers, output.lines())
            .with_context(|| format!("extract startup time of pod {namespace}/{pod}"))?;
        debug!(%pod, ?duration, "member startup");
        anyhow::Ok(duration)
    }))
    .await?;
    Ok(group_startup_duration(durations)?)
}

fn datacenter_members(sdc: &ScyllaDBDatacenter) -> anyhow::Result<Vec<Member>> {
    let sdc_name = sdc.name_any();
    if sdc.spec.racks.is_empty() {
        bail!("datacenter {sdc_name:?} has no racks");
    }
    let mut members = Vec::new();
    for rack in &sdc.spec.racks {
        let nodes = sdc
            .rack_node_count(rack)
            .with_context(|| format!("rack {:?} of {sdc_name:?} has no node count", rack.name))?;
        let nodes = u32::try_from(nodes)
            .with_context(|| format!("rack {:?} has a negative node count", rack.name))?;
        members.extend((0..nodes).map(|ordinal| Member {
            rack: rack.name.clone(),
            ordinal,
            pod: member_pod_name(&sdc_name, sdc.gossip_datacenter_name(), &rack.name, ordinal),
        }));
    }
    Ok(members)
}

fn single_dns_domain(sdc: &ScyllaDBDatacenter) -> anyhow::Result<&str> {
    match sdc.spec.dns_domains.as_slice() {
        [domain] => Ok(domain),
        domains => bail!(
            "expected exactly one DNS domain on datacenter {:?}, got {}",
            sdc.name_any(),
            domains.len()
        ),
    }
}

fn bound_volume_name(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.spec
        .as_ref()
        .and_then(|spec| spec.volume_name.clone())
        .filter(|name| !name.is_empty())
}

fn uid_of<K: Resource<DynamicType = ()>>(obj: &K) -> anyhow::Result<String> {
    obj.meta()
        .uid
        .clone()
        .with_context(|| format!("{} {:?} has no UID", K::kind(&()), obj.meta().name))
}
