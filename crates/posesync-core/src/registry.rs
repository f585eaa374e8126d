//! Declared connections between tracked objects

use crate::error::{Result, SyncError};
use crate::types::{ConnectionId, ObjectId};
use posesync_config::PrecisionConfig;
use posesync_spatial::Pose;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

/// A named, object-local pose that must align with a point on another object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPoint {
    pub object_id: ObjectId,
    pub name: String,
    /// Pose of the point relative to its object's origin
    pub local_pose: Pose,
}

impl ConnectionPoint {
    pub fn new(object_id: impl Into<ObjectId>, name: impl Into<String>, local_pose: Pose) -> Self {
        Self {
            object_id: object_id.into(),
            name: name.into(),
            local_pose,
        }
    }

    fn key(&self) -> (ObjectId, String) {
        (self.object_id.clone(), self.name.clone())
    }
}

/// Requirement that `point_a` stays aligned with `point_b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub id: ConnectionId,
    pub point_a: ConnectionPoint,
    pub point_b: ConnectionPoint,
    pub position_tolerance_m: f64,
    pub rotation_tolerance_deg: f64,
    /// Minimum precision score (0.0 to 1.0) for the connection to count as satisfied
    pub min_connection_precision: f64,
}

impl ConnectionSpec {
    /// Build a connection with the session's default tolerances.
    pub fn new(
        id: impl Into<ConnectionId>,
        point_a: ConnectionPoint,
        point_b: ConnectionPoint,
        defaults: &PrecisionConfig,
    ) -> Self {
        Self {
            id: id.into(),
            point_a,
            point_b,
            position_tolerance_m: defaults.default_position_tolerance_m,
            rotation_tolerance_deg: defaults.default_rotation_tolerance_deg,
            min_connection_precision: defaults.default_min_connection_precision,
        }
    }

    pub fn with_tolerances(mut self, position_m: f64, rotation_deg: f64) -> Self {
        self.position_tolerance_m = position_m;
        self.rotation_tolerance_deg = rotation_deg;
        self
    }

    pub fn with_min_precision(mut self, min_connection_precision: f64) -> Self {
        self.min_connection_precision = min_connection_precision;
        self
    }

    pub fn touches(&self, object_id: &str) -> bool {
        self.point_a.object_id == object_id || self.point_b.object_id == object_id
    }

    /// The point on `object_id` and the point it must meet, if this connection touches it
    pub fn points_for(&self, object_id: &str) -> Option<(&ConnectionPoint, &ConnectionPoint)> {
        if self.point_a.object_id == object_id {
            Some((&self.point_a, &self.point_b))
        } else if self.point_b.object_id == object_id {
            Some((&self.point_b, &self.point_a))
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| SyncError::InvalidConnection {
            connection_id: self.id.clone(),
            reason,
        };
        if !(self.position_tolerance_m.is_finite() && self.position_tolerance_m > 0.0) {
            return Err(invalid(format!(
                "position tolerance must be positive and finite, got {}",
                self.position_tolerance_m
            )));
        }
        if !(self.rotation_tolerance_deg.is_finite() && self.rotation_tolerance_deg > 0.0) {
            return Err(invalid(format!(
                "rotation tolerance must be positive and finite, got {}",
                self.rotation_tolerance_deg
            )));
        }
        if !(self.min_connection_precision > 0.0 && self.min_connection_precision <= 1.0) {
            return Err(invalid(format!(
                "minimum precision must lie in (0, 1], got {}",
                self.min_connection_precision
            )));
        }
        if self.point_a.object_id == self.point_b.object_id {
            return Err(invalid(format!(
                "both points belong to object {}",
                self.point_a.object_id
            )));
        }
        if !self.point_a.local_pose.is_finite() || !self.point_b.local_pose.is_finite() {
            return Err(invalid("connection point pose is not finite".to_string()));
        }
        Ok(())
    }
}

/// Store of [`ConnectionSpec`]s indexed by the objects they touch.
///
/// Iteration order is insertion order and stays stable across removals.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_slot: u64,
    specs: BTreeMap<u64, ConnectionSpec>,
    slots: HashMap<ConnectionId, u64>,
    by_object: HashMap<ObjectId, BTreeSet<u64>>,
    claimed: HashMap<(ObjectId, String), ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection.
    ///
    /// Fails if the id is taken or either named point is already claimed by
    /// another connection; the registry is unchanged on failure.
    pub fn register(&mut self, spec: ConnectionSpec) -> Result<()> {
        spec.validate()?;
        if self.slots.contains_key(&spec.id) {
            return Err(SyncError::DuplicateConnection(spec.id.clone()));
        }
        for point in [&spec.point_a, &spec.point_b] {
            if let Some(claimed_by) = self.claimed.get(&point.key()) {
                return Err(SyncError::DuplicateConnectionPoint {
                    object_id: point.object_id.clone(),
                    point: point.name.clone(),
                    claimed_by: claimed_by.clone(),
                });
            }
        }

        let slot = self.next_slot;
        self.next_slot += 1;
        for point in [&spec.point_a, &spec.point_b] {
            self.claimed.insert(point.key(), spec.id.clone());
            self.by_object
                .entry(point.object_id.clone())
                .or_default()
                .insert(slot);
        }
        info!(
            "Registered connection {} ({}.{} <-> {}.{})",
            spec.id,
            spec.point_a.object_id,
            spec.point_a.name,
            spec.point_b.object_id,
            spec.point_b.name
        );
        self.slots.insert(spec.id.clone(), slot);
        self.specs.insert(slot, spec);
        Ok(())
    }

    /// All connections touching `object_id`, in insertion order.
    pub fn connections_for(&self, object_id: &str) -> Vec<&ConnectionSpec> {
        self.by_object
            .get(object_id)
            .map(|slots| slots.iter().filter_map(|s| self.specs.get(s)).collect())
            .unwrap_or_default()
    }

    /// Remove every connection touching `object_id`. Idempotent.
    pub fn unregister(&mut self, object_id: &str) -> Vec<ConnectionSpec> {
        let slots = self.by_object.remove(object_id).unwrap_or_default();
        let removed: Vec<ConnectionSpec> = slots
            .into_iter()
            .filter_map(|slot| self.remove_slot(slot))
            .collect();
        if !removed.is_empty() {
            debug!(
                "Unregistered {} connection(s) touching {}",
                removed.len(),
                object_id
            );
        }
        removed
    }

    /// Remove a single connection by id.
    pub fn remove(&mut self, connection_id: &str) -> Option<ConnectionSpec> {
        let slot = *self.slots.get(connection_id)?;
        self.remove_slot(slot)
    }

    pub fn get(&self, connection_id: &str) -> Option<&ConnectionSpec> {
        self.slots
            .get(connection_id)
            .and_then(|slot| self.specs.get(slot))
    }

    /// Every connection in insertion order.
    pub fn all(&self) -> impl Iterator<Item = &ConnectionSpec> {
        self.specs.values()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    fn remove_slot(&mut self, slot: u64) -> Option<ConnectionSpec> {
        let spec = self.specs.remove(&slot)?;
        self.slots.remove(&spec.id);
        for point in [&spec.point_a, &spec.point_b] {
            self.claimed.remove(&point.key());
            if let Some(slots) = self.by_object.get_mut(&point.object_id) {
                slots.remove(&slot);
                if slots.is_empty() {
                    self.by_object.remove(&point.object_id);
                }
            }
        }
        Some(spec)
    }
}
