use std::{collections::BTreeMap, path::Path, time::Duration};

use anyhow::Context;
use bootkeeper_process::SlotId;

const DEFAULT_SETTLE_DELAY_MS: u64 = 1000;

/// Launch specification of one slot. The command strings are opaque and run
/// through `bash -c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSpec {
    pub id: SlotId,
    pub name: String,
    pub init: Vec<String>,
    pub command: String,
    pub settle_delay: Duration,
}

impl SlotSpec {
    pub fn new(id: u32, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: SlotId(id),
            name: name.into(),
            init: Vec::new(),
            command: command.into(),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
        }
    }

    pub fn with_init<I, S>(mut self, init: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.init = init.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Init steps and main command joined with `&&`, so a failing init step
    /// keeps the main command from running.
    pub fn shell_command(&self) -> String {
        if self.init.is_empty() {
            return self.command.clone();
        }
        let mut parts: Vec<&str> = self.init.iter().map(String::as_str).collect();
        parts.push(&self.command);
        parts.join(" && ")
    }
}

#[derive(Debug, serde::Deserialize)]
struct SlotFile {
    #[serde(default, rename = "slot")]
    slots: Vec<SlotEntry>,
}

#[derive(Debug, serde::Deserialize)]
struct SlotEntry {
    id: u32,
    name: String,
    #[serde(default)]
    init: Vec<String>,
    command: String,
    settle_delay_ms: Option<u64>,
}

/// Immutable id → spec lookup, iterated in ascending id order.
#[derive(Debug, Clone, Default)]
pub struct SlotRegistry {
    slots: BTreeMap<SlotId, SlotSpec>,
}

impl SlotRegistry {
    pub fn new(specs: impl IntoIterator<Item = SlotSpec>) -> anyhow::Result<Self> {
        let mut slots = BTreeMap::new();
        for spec in specs {
            if spec.id.0 == 0 {
                anyhow::bail!("slot id must be positive (slot {:?})", spec.name);
            }
            if spec.name.trim().is_empty() {
                anyhow::bail!("slot {} has an empty name", spec.id);
            }
            if spec.command.trim().is_empty() {
                anyhow::bail!("slot {} has an empty command", spec.id);
            }
            let id = spec.id;
            if slots.insert(id, spec).is_some() {
                anyhow::bail!("duplicate slot id: {id}");
            }
        }
        if slots.is_empty() {
            anyhow::bail!("no slots configured");
        }
        Ok(Self { slots })
    }

    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let file: SlotFile = toml::from_str(text).context("parse slot registry")?;
        Self::new(file.slots.into_iter().map(|e| SlotSpec {
            id: SlotId(e.id),
            name: e.name,
            init: e.init,
            command: e.command,
            settle_delay: Duration::from_millis(
                e.settle_delay_ms.unwrap_or(DEFAULT_SETTLE_DELAY_MS),
            ),
        }))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read slot registry {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("load {}", path.display()))
    }

    /// `BOOTKEEPER_SLOTS` if set, otherwise the built-in field deployment.
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var("BOOTKEEPER_SLOTS") {
            Ok(path) if !path.trim().is_empty() => Self::load(Path::new(path.trim())),
            _ => Ok(Self::builtin()),
        }
    }

    pub fn get(&self, id: SlotId) -> Option<&SlotSpec> {
        self.slots.get(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.slots.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SlotSpec> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Six-slot ROS deployment: odometry, flight-controller bridge, lidar
    /// driver, recorder, odometry→mavros bridge and packet capture.
    pub fn builtin() -> Self {
        let ros_env = [
            "source /opt/ros/noetic/setup.bash",
            "source /home/nvidia/dlio_ws/devel/setup.bash",
            "export PYTHONPATH=/opt/ros/noetic/lib/python3/dist-packages:$PYTHONPATH",
            "export ROS_MASTER_URI=http://localhost:11311",
            "export ROS_HOSTNAME=localhost",
        ];
        let secs = Duration::from_secs;

        let specs = vec![
            SlotSpec::new(
                1,
                "DLIO",
                "roslaunch direct_lidar_inertial_odometry dlio.launch rviz:=false pointcloud_topic:=/rslidar_points imu_topic:=/rslidar_imu_data",
            )
            .with_init(ros_env)
            .with_settle_delay(secs(2)),
            SlotSpec::new(
                2,
                "Mavros to Pixhawk",
                "roslaunch mavros apm.launch fcu_url:=/dev/ttyUSB0:921600",
            )
            .with_init(ros_env)
            .with_settle_delay(secs(3)),
            SlotSpec::new(3, "Airy SDK", "roslaunch rslidar_sdk start.launch")
                .with_init(ros_env)
                .with_settle_delay(secs(4)),
            SlotSpec::new(
                4,
                "Save DLIO Output",
                "python3 /home/nvidia/dlio_ws/src/saverostopic.py",
            )
            .with_init(ros_env)
            .with_settle_delay(secs(5)),
            SlotSpec::new(
                5,
                "DLIO to Mavros Publisher",
                "python3 /home/nvidia/dlio_ws/src/dlio-Mavros_bridge/scripts/test13.py",
            )
            .with_init(ros_env)
            .with_settle_delay(secs(1)),
            SlotSpec::new(
                6,
                "Save PCAP File",
                "tshark -i eth0 -w /home/nvidia/FLASK_CSD/PCAP_tshark/capture.pcap",
            )
            .with_settle_delay(secs(1)),
        ];

        let slots = specs.into_iter().map(|s| (s.id, s)).collect();
        Self { slots }
    }
}
