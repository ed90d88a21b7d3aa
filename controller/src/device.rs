// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! The per-device handler.
//!
//! One handler exists per ONU. It owns the device's lifecycle machine,
//! launches the configuration machines in response to device events, and
//! is the single place that talks to the orchestration system about this
//! device. Configuration machines never call each other; they emit a
//! [`DeviceEvent`] and the handler's dispatch task decides what runs
//! next.

use crate::ani;
use crate::config::Config;
use crate::entry::OnuDeviceEntry;
use crate::flows;
use crate::flows::FlowDecision;
use crate::flows::FlowDescription;
use crate::fsm::FsmHandle;
use crate::fsm::Machine;
use crate::fsm::Transition;
use crate::lock;
use crate::lock::AdminDirection;
use crate::messages::FsmMessage;
use crate::messages::IndicatedState;
use crate::messages::InterAdapterRequest;
use crate::messages::OnuIndication;
use crate::mib_download;
use crate::omci::OmciChannel;
use crate::proxy::ConnectState;
use crate::proxy::CoreProxy;
use crate::proxy::EventSink;
use crate::proxy::KvStore;
use crate::proxy::OnuActivatedEvent;
use crate::proxy::OperState;
use crate::proxy::PortDescriptor;
use crate::proxy::PortKind;
use crate::tech_profile::tp_id_from_path;
use crate::tech_profile::PonAniConfig;
use crate::tech_profile::TechProfileManager;
use crate::uni::mk_uni_port_num;
use crate::uni::OnuUniPort;
use crate::uni::UniKind;
use crate::vlan;
use crate::Error;
use crate::FREE_ALLOC_ID;
use omci_messages::me::AttrValue;
use omci_messages::me::Attribute;
use omci_messages::me::AttributeList;
use omci_messages::me::ClassId;
use omci_messages::me::MeRef;
use omci_messages::message::deserialize;
use omci_messages::message::Message;
use omci_messages::message::MessageBody;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::timeout;

/// Lifecycle phase of the device, as driven by indications.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Null,
    Init,
    Connected,
    Up,
    Down,
}

/// Events driving the lifecycle machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PhaseEvent {
    DeviceInit,
    TransportConnected,
    TransportDisconnected,
    DeviceUpInd,
    DeviceDownInd,
}

const LIFECYCLE: &[Transition<Phase, PhaseEvent>] = &[
    Transition {
        event: PhaseEvent::DeviceInit,
        from: &[Phase::Null, Phase::Down],
        to: Phase::Init,
    },
    Transition {
        event: PhaseEvent::TransportConnected,
        from: &[Phase::Init],
        to: Phase::Connected,
    },
    Transition {
        event: PhaseEvent::TransportDisconnected,
        from: &[Phase::Connected, Phase::Up, Phase::Down],
        to: Phase::Init,
    },
    Transition {
        event: PhaseEvent::DeviceUpInd,
        from: &[Phase::Connected, Phase::Down],
        to: Phase::Up,
    },
    Transition {
        event: PhaseEvent::DeviceDownInd,
        from: &[Phase::Connected, Phase::Up],
        to: Phase::Down,
    },
];

/// Operational reasons reported to the orchestration system, in the
/// order activation normally walks them.
pub const REASON_ACTIVATING: &str = "activating-onu";
pub const REASON_STARTING_OPENOMCI: &str = "starting-openomci";
pub const REASON_MIBSYNC_COMPLETE: &str = "discovery-mibsync-complete";
pub const REASON_INITIAL_MIB_DOWNLOADED: &str = "initial-mib-downloaded";
pub const REASON_TP_DOWNLOAD_SUCCESS: &str = "tech-profile-config-download-success";
pub const REASON_FLOWS_PUSHED: &str = "omci-flows-pushed";
pub const REASON_ADMIN_LOCK: &str = "omci-admin-lock";
pub const REASON_REENABLED: &str = "onu-reenabled";
pub const REASON_STOPPING: &str = "stopping-openomci";
pub const REASON_REBOOTING: &str = "rebooting-onu";

/// A completion notice from one of the configuration machines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceEvent {
    MibDatabaseSync,
    MibDownloadDone,
    UniUnlockDone,
    UniLockDone,
    OmciAniConfigDone { uni_id: u8 },
    OmciVlanFilterDone { uni_id: u8 },
}

/// Identity of the device this handler manages.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub device_id: String,
    pub parent_id: String,
    /// The parent's port this ONU hangs off; 0 selects the default.
    pub parent_port_no: u32,
    pub pon_intf_id: u32,
    pub onu_id: u32,
    pub serial_number: String,
    pub olt_serial_number: String,
}

pub struct DeviceHandler {
    info: DeviceInfo,
    config: Config,
    log: Logger,
    core: Arc<dyn CoreProxy>,
    event_sink: Arc<dyn EventSink>,
    entry: Arc<OnuDeviceEntry>,
    channel: Arc<OmciChannel>,
    tech_profiles: TechProfileManager,
    lifecycle: Mutex<Machine<Phase, PhaseEvent>>,
    unis: Mutex<Vec<OnuUniPort>>,
    reason: Mutex<String>,
    reachable: AtomicBool,
    reconciling: AtomicBool,
    ready_tx: watch::Sender<bool>,
    event_tx: mpsc::Sender<DeviceEvent>,
    download: TokioMutex<Option<FsmHandle<mib_download::State>>>,
    admin: TokioMutex<Option<(AdminDirection, FsmHandle<lock::State>)>>,
    ani_handles: TokioMutex<HashMap<u8, FsmHandle<ani::State>>>,
    vlan_handles: TokioMutex<HashMap<u8, FsmHandle<vlan::State>>>,
}

impl DeviceHandler {
    pub fn new(
        info: DeviceInfo,
        config: Config,
        core: Arc<dyn CoreProxy>,
        event_sink: Arc<dyn EventSink>,
        kv: Arc<dyn KvStore>,
        transport: mpsc::Sender<Message>,
        log: &Logger,
    ) -> Arc<Self> {
        let log = log.new(o!("device_id" => info.device_id.clone()));
        let channel = Arc::new(OmciChannel::new(&info.device_id, transport, &log));
        let entry = Arc::new(OnuDeviceEntry::new(&info.device_id, channel.clone(), &log));
        let tech_profiles = TechProfileManager::new(&info.device_id, kv, &log);
        let lifecycle = Machine::new("device-lifecycle", &info.device_id, Phase::Null, LIFECYCLE, &log);
        let (event_tx, event_rx) = mpsc::channel(config.fsm_queue_depth);
        let (ready_tx, _) = watch::channel(false);
        let handler = Arc::new(Self {
            info,
            config,
            log,
            core,
            event_sink,
            entry,
            channel,
            tech_profiles,
            lifecycle: Mutex::new(lifecycle),
            unis: Mutex::new(Vec::new()),
            reason: Mutex::new(String::new()),
            reachable: AtomicBool::new(false),
            reconciling: AtomicBool::new(false),
            ready_tx,
            event_tx,
            download: TokioMutex::new(None),
            admin: TokioMutex::new(None),
            ani_handles: TokioMutex::new(HashMap::new()),
            vlan_handles: TokioMutex::new(HashMap::new()),
        });
        tokio::spawn(dispatch(Arc::downgrade(&handler), event_rx));
        handler
    }

    pub fn device_id(&self) -> &str {
        &self.info.device_id
    }

    pub fn phase(&self) -> Phase {
        self.lifecycle.lock().unwrap().state()
    }

    pub fn reason(&self) -> String {
        self.reason.lock().unwrap().clone()
    }

    pub fn uni_ports(&self) -> Vec<OnuUniPort> {
        self.unis.lock().unwrap().clone()
    }

    /// Wait until the handler has been through device creation.
    pub async fn wait_until_ready(&self) -> Result<(), Error> {
        let mut rx = self.ready_tx.subscribe();
        timeout(self.config.entry_wait_timeout, async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    return Err(Error::Aborted);
                }
            }
            Ok(())
        })
        .await
        .map_err(|_| Error::Timeout("device entry"))?
    }

    fn apply_phase(&self, event: PhaseEvent) -> Result<Phase, Error> {
        self.lifecycle.lock().unwrap().apply(event)
    }

    /// Report `reason` to the orchestration system, once per change.
    fn set_reason(&self, reason: &str) {
        {
            let mut current = self.reason.lock().unwrap();
            if *current == reason {
                return;
            }
            *current = reason.to_string();
        }
        debug!(self.log, "operational reason"; "reason" => reason);
        if let Err(e) = self.core.device_reason_update(&self.info.device_id, reason) {
            warn!(self.log, "reason update failed"; "error" => %e);
        }
    }

    /// Begin managing the device: probe it, then synchronize the mirror
    /// in the background.
    ///
    /// Calling this while management is already underway is a no-op.
    pub async fn create_interface(&self) -> Result<(), Error> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if !lifecycle.can(PhaseEvent::DeviceInit) {
                debug!(
                    self.log,
                    "device already being managed";
                    "phase" => ?lifecycle.state(),
                );
                return Ok(());
            }
            lifecycle.apply(PhaseEvent::DeviceInit)?;
        }
        self.set_reason(REASON_ACTIVATING);
        if let Err(e) = self.core.device_state_update(
            &self.info.device_id,
            ConnectState::Reachable,
            OperState::Activating,
        ) {
            warn!(self.log, "state update failed"; "error" => %e);
        }
        if !self.reconciling.load(Ordering::Relaxed) {
            // The upstream PON-side port, registered once per adoption.
            // Unlike the other object-model calls, a failure here is
            // fatal to device creation.
            let port_no = match self.info.parent_port_no {
                0 => 1,
                n => n,
            };
            self.core.port_created(
                &self.info.device_id,
                &PortDescriptor {
                    port_no,
                    label: "PON port".to_string(),
                    kind: PortKind::PonOnu,
                    oper: OperState::Active,
                },
            )?;
        }
        self.apply_phase(PhaseEvent::TransportConnected)?;

        let reachable = self.entry.verify_reachable(self.config.probe_grace).await;
        self.reachable.store(reachable, Ordering::Relaxed);
        if !reachable {
            info!(self.log, "device did not answer probe, continuing anyway");
        }
        self.set_reason(REASON_STARTING_OPENOMCI);

        let entry = self.entry.clone();
        let events = self.event_tx.clone();
        let bound = self.config.response_timeout;
        let log = self.log.clone();
        tokio::spawn(async move {
            match entry.mib_sync(bound).await {
                Ok(count) => {
                    debug!(log, "synchronization finished"; "instances" => count);
                    let _ = events.send(DeviceEvent::MibDatabaseSync).await;
                }
                Err(e) => warn!(log, "synchronization failed"; "error" => %e),
            }
        });
        self.ready_tx.send_replace(true);
        Ok(())
    }

    /// Re-adopt a device known from a previous run: restore persisted
    /// profile paths, then walk activation again without re-announcing
    /// ports.
    pub async fn reconcile(&self) -> Result<(), Error> {
        self.reconciling.store(true, Ordering::Relaxed);
        let restored = self.tech_profiles.restore()?;
        info!(self.log, "reconciling"; "restored_profiles" => restored.len());
        self.create_interface().await
    }

    async fn handle_event(&self, event: DeviceEvent) {
        debug!(self.log, "device event"; "event" => ?event);
        match event {
            DeviceEvent::MibDatabaseSync => self.on_mib_synced().await,
            DeviceEvent::MibDownloadDone => self.on_download_done().await,
            DeviceEvent::UniUnlockDone => self.on_unlock_done().await,
            DeviceEvent::UniLockDone => self.on_lock_done(),
            DeviceEvent::OmciAniConfigDone { uni_id } => self.on_ani_done(uni_id).await,
            DeviceEvent::OmciVlanFilterDone { uni_id } => self.on_vlan_done(uni_id).await,
        }
    }

    /// The mirror is fresh: discover UNIs from it and start the initial
    /// download.
    async fn on_mib_synced(&self) {
        self.set_reason(REASON_MIBSYNC_COMPLETE);
        let db = self.entry.mib_snapshot().await;
        let reconciling = self.reconciling.load(Ordering::Relaxed);

        let mut discovered = Vec::new();
        let classes = [
            (ClassId::PPTP_ETHERNET_UNI, UniKind::Pptp),
            (ClassId::VIRTUAL_ETHERNET_INTERFACE_POINT, UniKind::Veip),
        ];
        for (class, kind) in classes {
            for entity_id in db.instances(class) {
                let uni_id = discovered.len() as u8;
                let port_no = mk_uni_port_num(self.info.pon_intf_id, self.info.onu_id, uni_id);
                if discovered.iter().any(|p: &OnuUniPort| p.port_no == port_no) {
                    warn!(self.log, "duplicate port number"; "port_no" => port_no);
                    continue;
                }
                let port = OnuUniPort::new(uni_id, port_no, entity_id, kind);
                if !reconciling {
                    let descriptor = PortDescriptor {
                        port_no,
                        label: port.name.clone(),
                        kind: PortKind::EthernetUni,
                        oper: OperState::Unknown,
                    };
                    if let Err(e) = self.core.port_created(&self.info.device_id, &descriptor) {
                        warn!(self.log, "port registration failed"; "error" => %e);
                    }
                }
                discovered.push(port);
            }
        }
        info!(self.log, "UNIs discovered"; "count" => discovered.len());
        *self.unis.lock().unwrap() = discovered.clone();

        let mut download = self.download.lock().await;
        if download.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!(self.log, "download already running, not restarting");
            return;
        }
        *download = Some(mib_download::start(
            &self.info.device_id,
            self.channel.clone(),
            discovered,
            self.event_tx.clone(),
            &self.config,
            &self.log,
        ));
    }

    async fn on_download_done(&self) {
        if let Err(e) = self.core.device_state_update(
            &self.info.device_id,
            ConnectState::Reachable,
            OperState::Active,
        ) {
            warn!(self.log, "state update failed"; "error" => %e);
        }
        self.set_reason(REASON_INITIAL_MIB_DOWNLOADED);
        self.run_admin(AdminDirection::Unlock).await;
    }

    /// Start an administrative machine, forcing down whichever one may
    /// still be running in the opposite direction.
    async fn run_admin(&self, direction: AdminDirection) {
        let mut admin = self.admin.lock().await;
        if let Some((running, mut handle)) = admin.take() {
            if !handle.is_finished() {
                info!(
                    self.log,
                    "forcing running admin machine down";
                    "running" => ?running,
                    "requested" => ?direction,
                );
                handle.abort().await;
                handle.finished().await;
            }
        }
        *admin = Some((
            direction,
            lock::start(
                &self.info.device_id,
                direction,
                self.channel.clone(),
                self.uni_ports(),
                self.event_tx.clone(),
                &self.config,
                &self.log,
            ),
        ));
    }

    fn set_port_states(&self, oper: OperState) {
        let mut unis = self.unis.lock().unwrap();
        for port in unis.iter_mut() {
            port.oper = oper;
            if let Err(e) = self
                .core
                .port_state_update(&self.info.device_id, port.port_no, oper)
            {
                warn!(self.log, "port state update failed"; "port_no" => port.port_no, "error" => %e);
            }
        }
    }

    async fn on_unlock_done(&self) {
        self.set_port_states(OperState::Active);
        if self.reconciling.swap(false, Ordering::Relaxed) {
            info!(self.log, "resuming provisioning from persisted profiles");
            self.resume_tech_profiles().await;
            return;
        }
        if self.reason() == REASON_ADMIN_LOCK {
            // Coming back from an administrative disable.
            self.set_reason(REASON_REENABLED);
        }
        self.event_sink.onu_activated(&OnuActivatedEvent {
            device_id: self.info.device_id.clone(),
            raised: true,
            pon_id: self.info.pon_intf_id,
            onu_id: self.info.onu_id,
            serial_number: self.info.serial_number.clone(),
            olt_serial_number: self.info.olt_serial_number.clone(),
        });
    }

    /// Re-run ANI provisioning from the restored per-UNI profiles, after
    /// the reconciliation unlock. Completion is observed through each
    /// machine's device event, as with a fresh download.
    async fn resume_tech_profiles(&self) {
        for (uni_id, path) in self.tech_profiles.paths() {
            if self.tech_profiles.is_done(uni_id) {
                continue;
            }
            let Some(profile) = self.tech_profiles.config(uni_id) else {
                warn!(self.log, "restored profile has no parameters"; "uni_id" => uni_id);
                continue;
            };
            let Some(tp_id) = tp_id_from_path(&path) else {
                warn!(self.log, "restored profile path carries no id"; "path" => path);
                continue;
            };
            let Some(uni) = self.uni_ports().into_iter().find(|p| p.uni_id == uni_id) else {
                warn!(self.log, "restored profile for unknown UNI"; "uni_id" => uni_id);
                continue;
            };
            let _ = self.start_ani(uni, tp_id, profile).await;
            info!(self.log, "resumed profile provisioning"; "uni_id" => uni_id, "tp_id" => tp_id);
        }
    }

    fn on_lock_done(&self) {
        self.set_reason(REASON_ADMIN_LOCK);
        self.set_port_states(OperState::Unknown);
        self.event_sink.onu_activated(&OnuActivatedEvent {
            device_id: self.info.device_id.clone(),
            raised: false,
            pon_id: self.info.pon_intf_id,
            onu_id: self.info.onu_id,
            serial_number: self.info.serial_number.clone(),
            olt_serial_number: self.info.olt_serial_number.clone(),
        });
    }

    async fn on_ani_done(&self, uni_id: u8) {
        self.tech_profiles.mark_done(uni_id, true);
        self.set_reason(REASON_TP_DOWNLOAD_SUCCESS);
        // A filter machine may be parked on this profile.
        let handles = self.vlan_handles.lock().await;
        if let Some(handle) = handles.get(&uni_id) {
            if handle.sender().send(FsmMessage::Proceed).await.is_err() {
                debug!(self.log, "no filter machine waiting"; "uni_id" => uni_id);
            }
        }
    }

    async fn on_vlan_done(&self, uni_id: u8) {
        self.set_reason(REASON_FLOWS_PUSHED);
        let mut handles = self.vlan_handles.lock().await;
        if let Some(handle) = handles.get(&uni_id) {
            if handle.is_finished() {
                handles.remove(&uni_id);
            }
        }
    }

    /// Handle one request relayed from the parent adapter.
    pub async fn process_inter_adapter_message(
        &self,
        request: InterAdapterRequest,
    ) -> Result<(), Error> {
        match request {
            InterAdapterRequest::OmciFrame(bytes) => {
                let (message, _) = deserialize(&bytes)?;
                self.channel.handle_response(message).await;
                Ok(())
            }
            InterAdapterRequest::OnuIndication(indication) => {
                self.on_indication(indication).await;
                Ok(())
            }
            InterAdapterRequest::TechProfileDownload {
                uni_id,
                path,
                config,
            } => self.tech_profile_download(uni_id, path, config).await,
            InterAdapterRequest::DeleteGemPort {
                uni_id,
                gem_port_id,
                ..
            } => {
                timeout(
                    self.config.delete_timeout,
                    self.delete_gem_port(uni_id, gem_port_id),
                )
                .await
                .map_err(|_| Error::DeadlineExceeded)?
            }
            InterAdapterRequest::DeleteTcont { uni_id, .. } => {
                timeout(self.config.delete_timeout, self.delete_tcont(uni_id))
                    .await
                    .map_err(|_| Error::DeadlineExceeded)?
            }
        }
    }

    async fn on_indication(&self, indication: OnuIndication) {
        debug!(
            self.log,
            "indication";
            "serial_number" => &indication.serial_number,
            "oper_state" => ?indication.oper_state,
        );
        match indication.oper_state {
            IndicatedState::Up => {
                match self.apply_phase(PhaseEvent::DeviceUpInd) {
                    Ok(_) => {}
                    Err(e) => {
                        debug!(self.log, "up indication not applicable"; "error" => %e);
                        return;
                    }
                }
                self.reachable.store(true, Ordering::Relaxed);
                if let Err(e) = self.core.device_state_update(
                    &self.info.device_id,
                    ConnectState::Reachable,
                    OperState::Active,
                ) {
                    warn!(self.log, "state update failed"; "error" => %e);
                }
                self.run_admin(AdminDirection::Unlock).await;
            }
            IndicatedState::Down | IndicatedState::Unreachable => {
                match self.apply_phase(PhaseEvent::DeviceDownInd) {
                    Ok(_) => {}
                    Err(e) => {
                        debug!(self.log, "down indication not applicable"; "error" => %e);
                        return;
                    }
                }
                self.reachable.store(false, Ordering::Relaxed);
                self.set_port_states(OperState::Unknown);
                if let Err(e) = self.core.device_state_update(
                    &self.info.device_id,
                    ConnectState::Unreachable,
                    OperState::Discovered,
                ) {
                    warn!(self.log, "state update failed"; "error" => %e);
                }
            }
        }
    }

    /// Replace any ANI machine for the UNI and start provisioning,
    /// returning its completion channel.
    async fn start_ani(
        &self,
        uni: OnuUniPort,
        tp_id: u16,
        profile: PonAniConfig,
    ) -> oneshot::Receiver<bool> {
        let db = self.entry.mib_snapshot().await;
        let (done_tx, done_rx) = oneshot::channel();
        let uni_id = uni.uni_id;
        let mut handles = self.ani_handles.lock().await;
        if let Some(mut old) = handles.remove(&uni_id) {
            if !old.is_finished() {
                old.abort().await;
                old.finished().await;
            }
        }
        handles.insert(
            uni_id,
            ani::start(
                &self.info.device_id,
                self.channel.clone(),
                uni,
                tp_id,
                profile,
                db,
                self.event_tx.clone(),
                done_tx,
                &self.config,
                &self.log,
            ),
        );
        done_rx
    }

    async fn tech_profile_download(
        &self,
        uni_id: u8,
        path: String,
        profile: PonAniConfig,
    ) -> Result<(), Error> {
        self.wait_until_ready().await?;
        let reason = self.reason();
        if reason == REASON_STOPPING || reason == REASON_ADMIN_LOCK {
            return Err(Error::WrongDevicePhase(reason));
        }
        let changed = self.tech_profiles.update_path(uni_id, &path);
        self.tech_profiles.set_config(uni_id, profile.clone());
        if !changed && self.tech_profiles.is_done(uni_id) {
            debug!(self.log, "profile already provisioned"; "uni_id" => uni_id);
            return Ok(());
        }
        let tp_id =
            tp_id_from_path(&path).ok_or(Error::Derivation("profile path carries no id"))?;
        let uni = self
            .uni_ports()
            .into_iter()
            .find(|p| p.uni_id == uni_id)
            .ok_or(Error::UnknownUniPort(u32::from(uni_id)))?;

        let done_rx = self.start_ani(uni, tp_id, profile).await;

        // The caller expects a synchronous verdict; hold it to the same
        // bound as any other response wait.
        match timeout(self.config.response_timeout, done_rx).await {
            Err(_) => Err(Error::DeadlineExceeded),
            Ok(Err(_)) => Err(Error::Aborted),
            Ok(Ok(false)) => Err(Error::Derivation("profile provisioning failed")),
            Ok(Ok(true)) => {
                self.tech_profiles.persist(uni_id)?;
                Ok(())
            }
        }
    }

    async fn delete_gem_port(&self, uni_id: u8, gem_port_id: u16) -> Result<(), Error> {
        let bound = self.config.delete_timeout;
        self.channel
            .request(
                MeRef::new(ClassId::GEM_INTERWORKING_TP, gem_port_id),
                MessageBody::DeleteRequest,
                bound,
            )
            .await?;
        self.channel
            .request(
                MeRef::new(ClassId::GEM_PORT_NETWORK_CTP, gem_port_id),
                MessageBody::DeleteRequest,
                bound,
            )
            .await?;
        self.tech_profiles.remove_gem_port(uni_id, gem_port_id);
        debug!(self.log, "GEM port removed"; "uni_id" => uni_id, "gem_port_id" => gem_port_id);
        Ok(())
    }

    async fn delete_tcont(&self, uni_id: u8) -> Result<(), Error> {
        let db = self.entry.mib_snapshot().await;
        let tcont = db
            .first_instance(ClassId::T_CONT)
            .ok_or(Error::Derivation("device reports no T-CONT"))?;
        let attrs = AttributeList::from_pairs(&[(
            Attribute::AllocId,
            AttrValue::U16(FREE_ALLOC_ID),
        )])?;
        self.channel
            .request(
                MeRef::new(ClassId::T_CONT, tcont),
                MessageBody::SetRequest { attrs },
                self.config.delete_timeout,
            )
            .await?;
        self.tech_profiles.clear(uni_id)?;
        debug!(self.log, "T-CONT freed"; "uni_id" => uni_id, "tcont" => tcont);
        Ok(())
    }

    /// Install the VLAN filter a flow asks for.
    ///
    /// At most one filter machine runs per UNI; a second flow for the
    /// same UNI is rejected while the first is still being installed.
    pub async fn add_flow(&self, flow: &FlowDescription) -> Result<(), Error> {
        if flow.cookie == 0 {
            debug!(self.log, "flow without cookie ignored");
            return Ok(());
        }
        self.wait_until_ready().await?;
        let uni = self
            .uni_ports()
            .into_iter()
            .find(|p| p.port_no == flow.in_port)
            .ok_or(Error::UnknownUniPort(flow.in_port))?;
        let params = match flows::decompose(flow)? {
            FlowDecision::Ignore(why) => {
                debug!(self.log, "flow ignored"; "why" => why);
                return Ok(());
            }
            FlowDecision::Install(params) => params,
        };

        let mut handles = self.vlan_handles.lock().await;
        if handles.get(&uni.uni_id).is_some_and(|h| !h.is_finished()) {
            return Err(Error::VlanFilterActive(uni.uni_id));
        }
        let ready = self.tech_profiles.is_done(uni.uni_id);
        let uni_id = uni.uni_id;
        handles.insert(
            uni_id,
            vlan::start(
                &self.info.device_id,
                self.channel.clone(),
                uni,
                params,
                ready,
                self.event_tx.clone(),
                &self.config,
                &self.log,
            ),
        );
        Ok(())
    }

    /// Administratively disable the device.
    pub async fn disable(&self) -> Result<(), Error> {
        if !self.reachable.load(Ordering::Relaxed) {
            return Err(Error::NotReachable(self.info.device_id.clone()));
        }
        self.run_admin(AdminDirection::Lock).await;
        Ok(())
    }

    /// Re-enable a previously disabled device.
    pub async fn reenable(&self) -> Result<(), Error> {
        if !self.reachable.load(Ordering::Relaxed) {
            return Err(Error::NotReachable(self.info.device_id.clone()));
        }
        self.run_admin(AdminDirection::Unlock).await;
        Ok(())
    }

    /// Reboot the device.
    pub async fn reboot(&self) -> Result<(), Error> {
        if !self.reachable.load(Ordering::Relaxed) {
            return Err(Error::NotReachable(self.info.device_id.clone()));
        }
        self.channel
            .request(
                MeRef::new(ClassId::ONU_G, 0),
                MessageBody::RebootRequest,
                self.config.response_timeout,
            )
            .await?;
        self.set_port_states(OperState::Unknown);
        self.set_reason(REASON_REBOOTING);
        Ok(())
    }

    /// Stop managing the device and drop everything persisted for it.
    pub async fn delete(&self) -> Result<(), Error> {
        self.set_reason(REASON_STOPPING);
        if let Some(handle) = self.download.lock().await.take() {
            handle.abort().await;
        }
        if let Some((_, handle)) = self.admin.lock().await.take() {
            handle.abort().await;
        }
        for (_, handle) in self.ani_handles.lock().await.drain() {
            handle.abort().await;
        }
        for (_, handle) in self.vlan_handles.lock().await.drain() {
            handle.abort().await;
        }
        self.tech_profiles.purge()
    }
}

async fn dispatch(handler: Weak<DeviceHandler>, mut rx: mpsc::Receiver<DeviceEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(handler) = handler.upgrade() else {
            return;
        };
        handler.handle_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tech_profile::GemPortParams;
    use crate::tech_profile::PonAniConfig;
    use crate::test_utils;
    use crate::test_utils::MemoryKvStore;
    use crate::test_utils::RecordingCoreProxy;
    use crate::test_utils::RecordingEventSink;
    use omci_messages::message::MessageKind;
    use std::time::Duration;

    const TCONT: u16 = 0x8001;
    const UNI_ENTITY: u16 = 0x101;

    fn info() -> DeviceInfo {
        DeviceInfo {
            device_id: "onu-1".to_string(),
            parent_id: "olt-1".to_string(),
            parent_port_no: 1,
            pon_intf_id: 1,
            onu_id: 2,
            serial_number: "ABCD01020304".to_string(),
            olt_serial_number: "OLT-1".to_string(),
        }
    }

    /// Play a device with one PPTP UNI, one T-CONT, and one queue pair.
    fn device_behavior(request: &Message) -> Option<Message> {
        let body = match &request.body {
            MessageBody::MibUploadRequest => MessageBody::MibUploadResponse { count: 4 },
            MessageBody::MibUploadNextRequest { seq } => {
                let (reported, attrs) = match seq {
                    0 => (
                        MeRef::new(ClassId::PPTP_ETHERNET_UNI, UNI_ENTITY),
                        AttributeList::empty(),
                    ),
                    1 => (
                        MeRef::new(ClassId::T_CONT, TCONT),
                        AttributeList::from_pairs(&[(
                            Attribute::AllocId,
                            AttrValue::U16(FREE_ALLOC_ID),
                        )])
                        .unwrap(),
                    ),
                    2 => (
                        MeRef::new(ClassId::PRIORITY_QUEUE, 0x8010),
                        AttributeList::from_pairs(&[(
                            Attribute::RelatedPort,
                            AttrValue::U32(u32::from(TCONT) << 16),
                        )])
                        .unwrap(),
                    ),
                    _ => (
                        MeRef::new(ClassId::PRIORITY_QUEUE, 0x0010),
                        AttributeList::from_pairs(&[(
                            Attribute::RelatedPort,
                            AttrValue::U32(1 << 16),
                        )])
                        .unwrap(),
                    ),
                };
                MessageBody::MibUploadNextResponse { reported, attrs }
            }
            _ => return Some(test_utils::success_response(request)),
        };
        Some(Message::new(request.header.tid, request.me, body))
    }

    struct Fixture {
        handler: Arc<DeviceHandler>,
        core: Arc<RecordingCoreProxy>,
        sink: Arc<RecordingEventSink>,
        kv: Arc<MemoryKvStore>,
        reflector: test_utils::Reflector,
    }

    fn fixture_with(behavior: fn(&Message) -> Option<Message>) -> Fixture {
        let log = test_utils::test_logger();
        let core = Arc::new(RecordingCoreProxy::default());
        let sink = Arc::new(RecordingEventSink::default());
        let kv = Arc::new(MemoryKvStore::default());
        let (transport_tx, transport_rx) = mpsc::channel(64);
        let handler = DeviceHandler::new(
            info(),
            Config::default(),
            core.clone(),
            sink.clone(),
            kv.clone(),
            transport_tx,
            &log,
        );
        let reflector =
            test_utils::reflect_with(handler.channel.clone(), transport_rx, behavior);
        Fixture {
            handler,
            core,
            sink,
            kv,
            reflector,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(device_behavior)
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let waited = timeout(Duration::from_secs(60), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        waited.unwrap_or_else(|_| panic!("never reached: {what}"));
    }

    async fn activate(fx: &Fixture) {
        fx.handler.create_interface().await.unwrap();
        let sink = fx.sink.clone();
        wait_until("activation event", move || {
            !sink.events.lock().unwrap().is_empty()
        })
        .await;
    }

    fn profile() -> PonAniConfig {
        PonAniConfig {
            alloc_id: 0x400,
            gem_ports: vec![GemPortParams {
                gem_id: 1024,
                direction: 3,
                prio_queue_index: 0,
                weight: crate::WEIGHT_STRICT_PRIORITY,
                pbit_map: 0xff,
            }],
        }
    }

    fn download() -> InterAdapterRequest {
        InterAdapterRequest::TechProfileDownload {
            uni_id: 0,
            path: "XGS-PON/64/olt-1/pon-1/onu-2/uni-0".to_string(),
            config: profile(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_walks_reasons_in_order() {
        let fx = fixture();
        activate(&fx).await;

        assert_eq!(
            fx.core.reasons.lock().unwrap().as_slice(),
            &[
                REASON_ACTIVATING,
                REASON_STARTING_OPENOMCI,
                REASON_MIBSYNC_COMPLETE,
                REASON_INITIAL_MIB_DOWNLOADED,
            ]
        );
        // The PON-side port went in at adoption, the discovered UNI
        // after synchronization.
        let ports = fx.core.ports.lock().unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port_no, 1);
        assert_eq!(ports[0].kind, PortKind::PonOnu);
        assert_eq!(ports[1].port_no, mk_uni_port_num(1, 2, 0));
        assert_eq!(ports[1].kind, PortKind::EthernetUni);
        drop(ports);
        // Unlocked ports reported active, activation event raised.
        assert_eq!(
            fx.core.port_states.lock().unwrap().last(),
            Some(&(mk_uni_port_num(1, 2, 0), OperState::Active))
        );
        let events = fx.sink.events.lock().unwrap();
        assert!(events[0].raised);
        assert_eq!(events[0].serial_number, "ABCD01020304");
        assert_eq!(fx.handler.phase(), Phase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_interface_is_idempotent() {
        let fx = fixture();
        activate(&fx).await;
        let reasons = fx.core.reasons.lock().unwrap().len();

        fx.handler.create_interface().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.core.reasons.lock().unwrap().len(), reasons);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tech_profile_then_flow() {
        let fx = fixture();
        activate(&fx).await;

        fx.handler
            .process_inter_adapter_message(download())
            .await
            .unwrap();
        let handler = fx.handler.clone();
        wait_until("profile done", move || {
            handler.tech_profiles.is_done(0)
        })
        .await;
        assert_eq!(fx.core.last_reason().as_deref(), Some(REASON_TP_DOWNLOAD_SUCCESS));
        // The profile survived to the store.
        let stored = fx.kv.get("onu-1/tp/0").unwrap().unwrap();
        assert!(stored.contains("XGS-PON/64/olt-1/pon-1/onu-2/uni-0"));

        let flow = FlowDescription {
            cookie: 7,
            in_port: mk_uni_port_num(1, 2, 0),
            match_vlan: Some(100),
            set_vlan: Some(100),
            pcp: None,
            ip_proto: None,
            metadata: 64 << 32,
        };
        fx.handler.add_flow(&flow).await.unwrap();
        let core = fx.core.clone();
        wait_until("flows pushed", move || {
            core.last_reason().as_deref() == Some(REASON_FLOWS_PUSHED)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_flow_rejected_while_filter_active() {
        let fx = fixture();
        activate(&fx).await;

        // No technology profile yet: the first filter machine parks.
        let flow = FlowDescription {
            cookie: 7,
            in_port: mk_uni_port_num(1, 2, 0),
            match_vlan: Some(100),
            set_vlan: Some(100),
            pcp: None,
            ip_proto: None,
            metadata: 64 << 32,
        };
        fx.handler.add_flow(&flow).await.unwrap();
        let second = fx.handler.add_flow(&flow).await;
        assert!(matches!(second, Err(Error::VlanFilterActive(0))));

        // Delivering the profile resumes the parked machine.
        fx.handler
            .process_inter_adapter_message(download())
            .await
            .unwrap();
        let core = fx.core.clone();
        wait_until("flows pushed", move || {
            core.last_reason().as_deref() == Some(REASON_FLOWS_PUSHED)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_locks_and_reenable_unlocks() {
        let fx = fixture();
        activate(&fx).await;

        fx.handler.disable().await.unwrap();
        let core = fx.core.clone();
        wait_until("admin lock", move || {
            core.last_reason().as_deref() == Some(REASON_ADMIN_LOCK)
        })
        .await;
        assert_eq!(
            fx.core.port_states.lock().unwrap().last(),
            Some(&(mk_uni_port_num(1, 2, 0), OperState::Unknown))
        );
        // The clearing event followed the raise.
        let sink = fx.sink.clone();
        wait_until("deactivation event", move || {
            sink.events.lock().unwrap().last().is_some_and(|e| !e.raised)
        })
        .await;

        fx.handler.reenable().await.unwrap();
        let core = fx.core.clone();
        wait_until("re-enabled", move || {
            core.last_reason().as_deref() == Some(REASON_REENABLED)
        })
        .await;
        assert_eq!(
            fx.core.port_states.lock().unwrap().last(),
            Some(&(mk_uni_port_num(1, 2, 0), OperState::Active))
        );
    }

    /// A device that swallows any ONU-G lock request, parking a lock run
    /// in its first response wait.
    fn behavior_dropping_onu_g_lock(request: &Message) -> Option<Message> {
        if let MessageBody::SetRequest { attrs } = &request.body {
            if request.me == MeRef::new(ClassId::ONU_G, 0)
                && attrs.get(Attribute::AdministrativeState) == Some(AttrValue::U8(1))
            {
                return None;
            }
        }
        device_behavior(request)
    }

    #[tokio::test(start_paused = true)]
    async fn test_opposite_admin_run_preempts_active_one() {
        let fx = fixture_with(behavior_dropping_onu_g_lock);
        activate(&fx).await;

        // The lock parks on the ONU-G answer that never comes; the
        // unlock must force it down before starting.
        fx.handler.disable().await.unwrap();
        fx.handler.reenable().await.unwrap();

        let sink = fx.sink.clone();
        wait_until("second activation event", move || {
            sink.events.lock().unwrap().iter().filter(|e| e.raised).count() >= 2
        })
        .await;
        // The preempted lock never completed: no lock reason was
        // reported and no deactivation event was published.
        assert!(!fx
            .core
            .reasons
            .lock()
            .unwrap()
            .iter()
            .any(|r| r == REASON_ADMIN_LOCK));
        assert!(fx.sink.events.lock().unwrap().iter().all(|e| e.raised));
        assert_eq!(
            fx.core.port_states.lock().unwrap().last(),
            Some(&(mk_uni_port_num(1, 2, 0), OperState::Active))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_times_out_before_device_ready() {
        let fx = fixture();
        // No adoption has happened, so the readiness wait runs out.
        let err = fx.handler.process_inter_adapter_message(download()).await;
        assert!(matches!(err, Err(Error::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_rejected_while_locked() {
        let fx = fixture();
        activate(&fx).await;
        fx.handler.disable().await.unwrap();
        let core = fx.core.clone();
        wait_until("admin lock", move || {
            core.last_reason().as_deref() == Some(REASON_ADMIN_LOCK)
        })
        .await;

        let rejected = fx.handler.process_inter_adapter_message(download()).await;
        assert!(matches!(rejected, Err(Error::WrongDevicePhase(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_reports_reason_and_downs_ports() {
        let fx = fixture();
        activate(&fx).await;

        fx.handler.reboot().await.unwrap();
        assert_eq!(fx.handler.reason(), REASON_REBOOTING);
        let requests = fx.reflector.requests.lock().unwrap();
        let reboot = requests
            .iter()
            .find(|m| m.kind() == MessageKind::RebootRequest)
            .unwrap();
        assert_eq!(reboot.me, MeRef::new(ClassId::ONU_G, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_down_indication_downs_ports() {
        let fx = fixture();
        activate(&fx).await;
        // The lifecycle machine needs the device up first.
        fx.handler
            .process_inter_adapter_message(InterAdapterRequest::OnuIndication(OnuIndication {
                intf_id: 1,
                onu_id: 2,
                oper_state: IndicatedState::Up,
                serial_number: "ABCD01020304".to_string(),
            }))
            .await
            .unwrap();
        assert_eq!(fx.handler.phase(), Phase::Up);

        fx.handler
            .process_inter_adapter_message(InterAdapterRequest::OnuIndication(OnuIndication {
                intf_id: 1,
                onu_id: 2,
                oper_state: IndicatedState::Down,
                serial_number: "ABCD01020304".to_string(),
            }))
            .await
            .unwrap();
        assert_eq!(fx.handler.phase(), Phase::Down);
        assert_eq!(
            fx.core.states.lock().unwrap().last(),
            Some(&(ConnectState::Unreachable, OperState::Discovered))
        );
        assert_eq!(
            fx.core.port_states.lock().unwrap().last(),
            Some(&(mk_uni_port_num(1, 2, 0), OperState::Unknown))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_purges_persisted_state() {
        let fx = fixture();
        activate(&fx).await;
        fx.handler
            .process_inter_adapter_message(download())
            .await
            .unwrap();
        assert!(fx.kv.get("onu-1/tp/0").unwrap().is_some());

        fx.handler.delete().await.unwrap();
        assert_eq!(fx.handler.reason(), REASON_STOPPING);
        assert!(fx.kv.list("onu-1/tp/").unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_gem_port_and_tcont() {
        let fx = fixture();
        activate(&fx).await;
        fx.handler
            .process_inter_adapter_message(download())
            .await
            .unwrap();

        fx.handler
            .process_inter_adapter_message(InterAdapterRequest::DeleteGemPort {
                uni_id: 0,
                tp_path: "XGS-PON/64/olt-1/pon-1/onu-2/uni-0".to_string(),
                gem_port_id: 1024,
            })
            .await
            .unwrap();
        assert!(fx
            .handler
            .tech_profiles
            .config(0)
            .unwrap()
            .gem_ports
            .is_empty());

        fx.handler
            .process_inter_adapter_message(InterAdapterRequest::DeleteTcont {
                uni_id: 0,
                tp_path: "XGS-PON/64/olt-1/pon-1/onu-2/uni-0".to_string(),
                alloc_id: 0x400,
            })
            .await
            .unwrap();
        // The path is forgotten, in memory and in the store.
        assert!(fx.handler.tech_profiles.path(0).is_none());
        assert!(fx.kv.get("onu-1/tp/0").unwrap().is_none());

        let requests = fx.reflector.requests.lock().unwrap();
        let deletes: Vec<_> = requests
            .iter()
            .filter(|m| m.kind() == MessageKind::DeleteRequest)
            .map(|m| m.me)
            .collect();
        assert_eq!(
            deletes,
            vec![
                MeRef::new(ClassId::GEM_INTERWORKING_TP, 1024),
                MeRef::new(ClassId::GEM_PORT_NETWORK_CTP, 1024),
            ]
        );
        // The T-CONT went back to the free alloc-id.
        let freed = requests
            .iter()
            .rev()
            .find(|m| m.me == MeRef::new(ClassId::T_CONT, TCONT))
            .unwrap();
        let MessageBody::SetRequest { attrs } = &freed.body else {
            panic!("T-CONT not freed: {freed:?}");
        };
        assert_eq!(
            attrs.get(Attribute::AllocId),
            Some(AttrValue::U16(FREE_ALLOC_ID))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_restores_paths_without_reannouncing_ports() {
        let fx = fixture();
        // A previous run of the adapter persisted this profile.
        let seeder = TechProfileManager::new("onu-1", fx.kv.clone(), &test_utils::test_logger());
        seeder.update_path(0, "XGS-PON/64/olt-1/pon-1/onu-2/uni-0");
        seeder.set_config(0, profile());
        seeder.persist(0).unwrap();

        fx.handler.reconcile().await.unwrap();
        let handler = fx.handler.clone();
        wait_until("provisioning resumed", move || {
            handler.tech_profiles.is_done(0)
        })
        .await;

        // Ports were rediscovered but not re-announced, and no fresh
        // activation event was raised.
        assert!(fx.core.ports.lock().unwrap().is_empty());
        assert!(fx.sink.events.lock().unwrap().is_empty());
        assert!(!fx.handler.reconciling.load(Ordering::Relaxed));
        assert_eq!(
            fx.handler.tech_profiles.path(0).as_deref(),
            Some("XGS-PON/64/olt-1/pon-1/onu-2/uni-0")
        );
        // The restored profile was actually pushed to the device again.
        assert_eq!(fx.reflector.count_class(ClassId::T_CONT), 1);
        assert_eq!(fx.reflector.count_class(ClassId::GEM_PORT_NETWORK_CTP), 1);
        assert_eq!(
            fx.core.last_reason().as_deref(),
            Some(REASON_TP_DOWNLOAD_SUCCESS)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_omci_frame_passthrough() {
        let fx = fixture();
        let mut buf = [0u8; omci_messages::MAX_MESSAGE_SIZE];
        let frame = Message::new(
            99,
            MeRef::new(ClassId::ONU2_G, 0),
            MessageBody::SetResponse {
                result: omci_messages::message::ResultCode::Success,
            },
        );
        let n = omci_messages::message::serialize(&mut buf, &frame).unwrap();

        // No outstanding transaction 99: counted as unmatched.
        fx.handler
            .process_inter_adapter_message(InterAdapterRequest::OmciFrame(buf[..n].to_vec()))
            .await
            .unwrap();
        assert_eq!(fx.handler.channel.stats().rx_unmatched, 1);

        let garbage = vec![0xff; 4];
        let err = fx
            .handler
            .process_inter_adapter_message(InterAdapterRequest::OmciFrame(garbage))
            .await;
        assert!(matches!(err, Err(Error::Envelope(_))));
    }
}
