//! Request context for request-scoped identity information
//!
//! A context is bound to one inbound request with [`scope`] (async) or
//! [`sync_scope`]. The binding lives exactly as long as the wrapped future or
//! closure, so it is released on success, error, panic and cancellation
//! alike. Outside a scope there is no context and nothing to leak.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::future::Future;

use datascope_common::{Error, Result, RoleType};

use crate::rule::ContextField;

/// Resolved identity of the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub user_id: i64,
    pub role: RoleType,
    /// Set only for students
    pub student_id: Option<i64>,
    /// Set only for teachers
    pub teacher_id: Option<i64>,
    /// Request-level bypass: every statement of this request skips filtering
    #[serde(default)]
    pub ignore_permission_filter: bool,
}

impl RequestContext {
    pub fn new(user_id: i64, role: RoleType) -> Self {
        Self {
            user_id,
            role,
            student_id: None,
            teacher_id: None,
            ignore_permission_filter: false,
        }
    }

    pub fn admin(user_id: i64) -> Self {
        Self::new(user_id, RoleType::Admin)
    }

    pub fn teacher(user_id: i64, teacher_id: i64) -> Self {
        Self::new(user_id, RoleType::Teacher).with_teacher_id(teacher_id)
    }

    pub fn student(user_id: i64, student_id: i64) -> Self {
        Self::new(user_id, RoleType::Student).with_student_id(student_id)
    }

    #[must_use]
    pub fn with_student_id(mut self, student_id: i64) -> Self {
        self.student_id = Some(student_id);
        self
    }

    #[must_use]
    pub fn with_teacher_id(mut self, teacher_id: i64) -> Self {
        self.teacher_id = Some(teacher_id);
        self
    }

    /// Set the request-level bypass flag
    #[must_use]
    pub fn ignoring_permission_filter(mut self) -> Self {
        self.ignore_permission_filter = true;
        self
    }

    /// Check if statements issued under this context skip filtering
    #[must_use]
    pub fn bypasses_filter(&self) -> bool {
        self.ignore_permission_filter || self.role.is_admin()
    }

    /// Value of a context field, `None` when the caller carries none
    #[must_use]
    pub fn value_of(&self, field: ContextField) -> Option<ContextValue> {
        let value = match field {
            ContextField::UserId => Some(self.user_id),
            ContextField::StudentId => self.student_id,
            ContextField::TeacherId => self.teacher_id,
        };
        value.map(ContextValue)
    }

    /// Check the caller's role against an explicit allow list
    ///
    /// # Errors
    /// Returns `Forbidden` when the role is not listed.
    pub fn require_role(&self, allowed: &[RoleType]) -> Result<()> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(Error::Forbidden)
        }
    }
}

/// Filter value taken from a [`RequestContext`].
///
/// There is no public constructor: the only way to obtain one is
/// [`RequestContext::value_of`], so predicate values and template
/// substitutions can never originate from caller-supplied statement input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextValue(i64);

impl ContextValue {
    #[must_use]
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Slot {
    context: Option<RequestContext>,
    ignore_permission_filter: bool,
}

impl Slot {
    fn new(context: Option<RequestContext>) -> Self {
        Self {
            context,
            ignore_permission_filter: false,
        }
    }

    fn effective(&self) -> Option<RequestContext> {
        self.context.clone().map(|mut ctx| {
            ctx.ignore_permission_filter |= self.ignore_permission_filter;
            ctx
        })
    }
}

tokio::task_local! {
    static REQUEST_SLOT: RefCell<Slot>;
}

/// Run `f` with `context` bound as the current request context
pub async fn scope<F: Future>(context: Option<RequestContext>, f: F) -> F::Output {
    REQUEST_SLOT.scope(RefCell::new(Slot::new(context)), f).await
}

/// Synchronous counterpart of [`scope`] for blocking workers
pub fn sync_scope<F, R>(context: Option<RequestContext>, f: F) -> R
where
    F: FnOnce() -> R,
{
    REQUEST_SLOT.sync_scope(RefCell::new(Slot::new(context)), f)
}

/// Check if a request scope is active on this task
#[must_use]
pub fn is_active() -> bool {
    REQUEST_SLOT.try_with(|_| ()).is_ok()
}

/// Current request context, `None` outside a scope or for anonymous requests
#[must_use]
pub fn current() -> Option<RequestContext> {
    REQUEST_SLOT
        .try_with(|slot| slot.borrow().effective())
        .ok()
        .flatten()
}

/// Replace the context of the active scope
///
/// # Errors
/// Returns `NoActiveScope` when called outside [`scope`]/[`sync_scope`].
pub fn set(context: RequestContext) -> Result<()> {
    REQUEST_SLOT
        .try_with(|slot| slot.borrow_mut().context = Some(context))
        .map_err(|_| Error::NoActiveScope)
}

/// Drop the context and bypass flag of the active scope, if any
pub fn clear() {
    let _ = REQUEST_SLOT.try_with(|slot| *slot.borrow_mut() = Slot::default());
}

/// Set the request-level bypass flag of the active scope
///
/// # Errors
/// Returns `NoActiveScope` when called outside a scope.
pub fn set_ignore_permission_filter(ignore: bool) -> Result<()> {
    REQUEST_SLOT
        .try_with(|slot| slot.borrow_mut().ignore_permission_filter = ignore)
        .map_err(|_| Error::NoActiveScope)
}

/// Check the request-level bypass flag of the active scope
#[must_use]
pub fn is_permission_filter_ignored() -> bool {
    REQUEST_SLOT
        .try_with(|slot| {
            let slot = slot.borrow();
            slot.ignore_permission_filter
                || slot
                    .context
                    .as_ref()
                    .map_or(false, |ctx| ctx.ignore_permission_filter)
        })
        .unwrap_or(false)
}

struct RestoreIgnoreFlag(bool);

impl Drop for RestoreIgnoreFlag {
    fn drop(&mut self) {
        let previous = self.0;
        let _ = REQUEST_SLOT.try_with(|slot| slot.borrow_mut().ignore_permission_filter = previous);
    }
}

/// Run `f` with the request-level bypass flag set, restoring the previous
/// value afterwards (also when `f` panics). Outside a scope `f` simply runs.
pub fn without_permission_filter<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let previous = REQUEST_SLOT
        .try_with(|slot| std::mem::replace(&mut slot.borrow_mut().ignore_permission_filter, true))
        .ok();
    let _restore = previous.map(RestoreIgnoreFlag);
    f()
}
