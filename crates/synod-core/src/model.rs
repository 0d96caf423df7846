// Core data models for cluster members and the data they hold
// Every member keeps its own Dataset copy; the coordinator's copy is authoritative.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};

/// Identity of a cluster member. Ids are unique and totally ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub u32);

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl From<u32> for MemberId {
    fn from(value: u32) -> Self {
        MemberId(value)
    }
}

/// Binary liveness of a member
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberStatus {
    #[default]
    Active,
    Crashed,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Active => "ACTIVE",
            MemberStatus::Crashed => "CRASHED",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, MemberStatus::Active)
    }
}

impl Display for MemberStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Product,
    Order,
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Product => write!(f, "product"),
            EntityKind::Order => write!(f, "order"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub stock: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub product_id: String,
    pub quantity: u32,
    pub customer: String,
    /// Creation time in milliseconds since UNIX epoch
    pub created_at: i64,
}

/// A replicated write target
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Product(Product),
    Order(Order),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Product(_) => EntityKind::Product,
            Entity::Order(_) => EntityKind::Order,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Entity::Product(p) => &p.id,
            Entity::Order(o) => &o.id,
        }
    }
}

/// A single write, as applied locally and shipped to replication targets
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub operation: Operation,
    pub entity: Entity,
}

impl Mutation {
    pub fn new(operation: Operation, entity: Entity) -> Self {
        Self { operation, entity }
    }
}

/// One member's copy of the cluster data
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub products: BTreeMap<String, Product>,
    pub orders: BTreeMap<String, Order>,
}

impl Dataset {
    /// Number of entities held, across all kinds
    pub fn len(&self) -> usize {
        self.products.len() + self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty() && self.orders.is_empty()
    }

    pub fn product(&self, id: &str) -> Option<&Product> {
        self.products.get(id)
    }

    pub fn order(&self, id: &str) -> Option<&Order> {
        self.orders.get(id)
    }

    pub fn contains(&self, kind: EntityKind, id: &str) -> bool {
        match kind {
            EntityKind::Product => self.products.contains_key(id),
            EntityKind::Order => self.orders.contains_key(id),
        }
    }

    /// Apply a replicated mutation. Create and Update are upserts (last writer
    /// wins); Delete removes by id. An order Create also takes its quantity
    /// out of the referenced product's stock.
    pub fn apply(&mut self, mutation: &Mutation) {
        match (&mutation.operation, &mutation.entity) {
            (Operation::Create | Operation::Update, Entity::Product(product)) => {
                self.products.insert(product.id.clone(), product.clone());
            }
            (Operation::Create, Entity::Order(order)) => {
                if let Some(product) = self.products.get_mut(&order.product_id) {
                    product.stock = product.stock.saturating_sub(order.quantity);
                }
                self.orders.insert(order.id.clone(), order.clone());
            }
            (Operation::Update, Entity::Order(order)) => {
                self.orders.insert(order.id.clone(), order.clone());
            }
            (Operation::Delete, Entity::Product(product)) => {
                self.products.remove(&product.id);
            }
            (Operation::Delete, Entity::Order(order)) => {
                self.orders.remove(&order.id);
            }
        }
    }

    /// Execute a work item against this dataset, returning the mutation to
    /// replicate. Business rules are checked before anything is written.
    pub fn execute(&mut self, work: &WorkItem, order_id: &str, now_ms: i64) -> Result<Mutation> {
        let mutation = match work {
            WorkItem::PlaceOrder {
                product_id,
                quantity,
                customer,
            } => {
                if *quantity == 0 {
                    return Err(ClusterError::InvalidArgument(
                        "order quantity must be positive".to_string(),
                    ));
                }
                let product =
                    self.products
                        .get(product_id)
                        .ok_or_else(|| ClusterError::EntityNotFound {
                            kind: EntityKind::Product,
                            id: product_id.clone(),
                        })?;
                if product.stock < *quantity {
                    return Err(ClusterError::InsufficientStock {
                        product_id: product_id.clone(),
                        requested: *quantity,
                        available: product.stock,
                    });
                }
                Mutation::new(
                    Operation::Create,
                    Entity::Order(Order {
                        id: order_id.to_string(),
                        product_id: product_id.clone(),
                        quantity: *quantity,
                        customer: customer.clone(),
                        created_at: now_ms,
                    }),
                )
            }
            WorkItem::PutProduct(product) => {
                if product.id.is_empty() {
                    return Err(ClusterError::InvalidArgument(
                        "product id must not be empty".to_string(),
                    ));
                }
                let operation = if self.products.contains_key(&product.id) {
                    Operation::Update
                } else {
                    Operation::Create
                };
                Mutation::new(operation, Entity::Product(product.clone()))
            }
            WorkItem::DeleteProduct { id } => {
                let product =
                    self.products
                        .get(id)
                        .cloned()
                        .ok_or_else(|| ClusterError::EntityNotFound {
                            kind: EntityKind::Product,
                            id: id.clone(),
                        })?;
                Mutation::new(Operation::Delete, Entity::Product(product))
            }
        };

        self.apply(&mutation);
        Ok(mutation)
    }
}

/// A cluster member and its local state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: MemberId,
    pub status: MemberStatus,
    pub is_coordinator: bool,
    pub dataset: Dataset,
    /// Last status change in milliseconds since UNIX epoch
    pub status_changed_at: i64,
}

impl Member {
    pub fn new(id: MemberId, dataset: Dataset) -> Self {
        Self {
            id,
            status: MemberStatus::Active,
            is_coordinator: false,
            dataset,
            status_changed_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// An incoming unit of work routed by the dispatcher
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkItem {
    #[serde(rename_all = "camelCase")]
    PlaceOrder {
        product_id: String,
        quantity: u32,
        customer: String,
    },
    PutProduct(Product),
    DeleteProduct { id: String },
}

impl WorkItem {
    pub fn kind(&self) -> EntityKind {
        match self {
            WorkItem::PlaceOrder { .. } => EntityKind::Order,
            WorkItem::PutProduct(_) | WorkItem::DeleteProduct { .. } => EntityKind::Product,
        }
    }
}

/// Load-balancing policy used to pick a member for each work item
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
    LeastResponseTime,
}

impl DispatchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchPolicy::RoundRobin => "round_robin",
            DispatchPolicy::LeastConnections => "least_connections",
            DispatchPolicy::Weighted => "weighted",
            DispatchPolicy::LeastResponseTime => "least_response_time",
        }
    }
}

impl Display for DispatchPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DispatchPolicy {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(DispatchPolicy::RoundRobin),
            "least_connections" | "leastconnections" => Ok(DispatchPolicy::LeastConnections),
            "weighted" => Ok(DispatchPolicy::Weighted),
            "least_response_time" | "leastresponsetime" => Ok(DispatchPolicy::LeastResponseTime),
            other => Err(ClusterError::InvalidArgument(format!(
                "unknown dispatch policy '{}'",
                other
            ))),
        }
    }
}
