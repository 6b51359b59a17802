//! Location wire messages
//!
//! Opcodes 2001-2010. Keys are raw `u64` object ids; instances are full
//! addresses so the directory can answer with a routable owner.

use serde::{Deserialize, Serialize};
use strand_types::{ActorId, ActorMessage, ActorRequest};

pub const OBJECT_ADD_REQUEST: u16 = 2001;
pub const OBJECT_ADD_RESPONSE: u16 = 2002;
pub const OBJECT_GET_REQUEST: u16 = 2003;
pub const OBJECT_GET_RESPONSE: u16 = 2004;
pub const OBJECT_LOCK_REQUEST: u16 = 2005;
pub const OBJECT_LOCK_RESPONSE: u16 = 2006;
pub const OBJECT_UNLOCK_REQUEST: u16 = 2007;
pub const OBJECT_UNLOCK_RESPONSE: u16 = 2008;
pub const OBJECT_REMOVE_REQUEST: u16 = 2009;
pub const OBJECT_REMOVE_RESPONSE: u16 = 2010;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAddRequest {
    pub key: u64,
    pub instance_id: ActorId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAddResponse;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectGetRequest {
    pub key: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectGetResponse {
    /// `None` when the key is not registered
    pub instance_id: Option<ActorId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLockRequest {
    pub key: u64,
    /// Must match the current owner
    pub instance_id: ActorId,
    /// Lease in milliseconds, 0 for the directory default
    pub lease_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLockResponse;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectUnlockRequest {
    pub key: u64,
    /// Lock token: the instance that locked the key
    pub old_instance_id: ActorId,
    /// New owner, `ActorId::ZERO` to keep the old one
    pub instance_id: ActorId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectUnlockResponse;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRemoveRequest {
    pub key: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRemoveResponse;

impl ActorMessage for ObjectAddRequest {
    const OPCODE: u16 = OBJECT_ADD_REQUEST;
}
impl ActorMessage for ObjectAddResponse {
    const OPCODE: u16 = OBJECT_ADD_RESPONSE;
}
impl ActorRequest for ObjectAddRequest {
    type Response = ObjectAddResponse;
}

impl ActorMessage for ObjectGetRequest {
    const OPCODE: u16 = OBJECT_GET_REQUEST;
}
impl ActorMessage for ObjectGetResponse {
    const OPCODE: u16 = OBJECT_GET_RESPONSE;
}
impl ActorRequest for ObjectGetRequest {
    type Response = ObjectGetResponse;
}

impl ActorMessage for ObjectLockRequest {
    const OPCODE: u16 = OBJECT_LOCK_REQUEST;
}
impl ActorMessage for ObjectLockResponse {
    const OPCODE: u16 = OBJECT_LOCK_RESPONSE;
}
impl ActorRequest for ObjectLockRequest {
    type Response = ObjectLockResponse;
}

impl ActorMessage for ObjectUnlockRequest {
    const OPCODE: u16 = OBJECT_UNLOCK_REQUEST;
}
impl ActorMessage for ObjectUnlockResponse {
    const OPCODE: u16 = OBJECT_UNLOCK_RESPONSE;
}
impl ActorRequest for ObjectUnlockRequest {
    type Response = ObjectUnlockResponse;
}

impl ActorMessage for ObjectRemoveRequest {
    const OPCODE: u16 = OBJECT_REMOVE_REQUEST;
}
impl ActorMessage for ObjectRemoveResponse {
    const OPCODE: u16 = OBJECT_REMOVE_RESPONSE;
}
impl ActorRequest for ObjectRemoveRequest {
    type Response = ObjectRemoveResponse;
}
