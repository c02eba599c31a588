use std::{
    cell::RefCell,
    ops::Deref,
    rc::{Rc, Weak},
};

use crate::math::{scalar_prods2, scalar_prods3};

struct StateStorage {
    free_states: RefCell<Vec<Rc<InnerState>>>,
}

impl StateStorage {
    fn with_capacity(capacity: usize) -> StateStorage {
        StateStorage {
            free_states: RefCell::new(Vec::with_capacity(capacity)),
        }
    }

    fn reuse_state(&self, state: Rc<InnerState>) {
        self.free_states.borrow_mut().push(state)
    }
}

/// Hands out phase-space points and takes them back once the last
/// reference is dropped, so a trajectory does not allocate per leapfrog.
pub(crate) struct StatePool {
    storage: Rc<StateStorage>,
    dim: usize,
}

impl StatePool {
    pub(crate) fn with_capacity(dim: usize, capacity: usize) -> StatePool {
        StatePool {
            storage: Rc::new(StateStorage::with_capacity(capacity)),
            dim,
        }
    }

    pub(crate) fn new_state(&mut self) -> State {
        let inner = match self.storage.free_states.borrow_mut().pop() {
            Some(inner) => {
                assert!(self.dim == inner.q.len(), "dim mismatch in state pool");
                inner
            }
            None => Rc::new(InnerState::new(self.dim)),
        };
        State {
            inner: Some(inner),
            reuser: Rc::downgrade(&self.storage),
        }
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.storage.free_states.borrow().len()
    }
}

/// A point in phase space.
///
/// `p_sum` holds the sum of the momenta from the start of the trajectory
/// up to and including this point, in the direction this point lies in.
#[derive(Debug, Clone)]
pub(crate) struct InnerState {
    pub(crate) p: Box<[f64]>,
    pub(crate) q: Box<[f64]>,
    pub(crate) v: Box<[f64]>,
    pub(crate) p_sum: Box<[f64]>,
    pub(crate) grad: Box<[f64]>,
    pub(crate) idx_in_trajectory: i64,
    pub(crate) kinetic_energy: f64,
    pub(crate) potential_energy: f64,
    pub(crate) initial_energy: f64,
}

impl InnerState {
    fn new(size: usize) -> InnerState {
        InnerState {
            p: vec![0.; size].into(),
            q: vec![0.; size].into(),
            v: vec![0.; size].into(),
            p_sum: vec![0.; size].into(),
            grad: vec![0.; size].into(),
            idx_in_trajectory: 0,
            kinetic_energy: 0.,
            potential_energy: 0.,
            initial_energy: 0.,
        }
    }

    pub(crate) fn first_momentum_halfstep(&self, out: &mut InnerState, epsilon: f64) {
        crate::math::axpy_out(&self.grad, &self.p, epsilon / 2., &mut out.p);
    }

    pub(crate) fn position_step(&self, out: &mut InnerState, epsilon: f64) {
        crate::math::axpy_out(&out.v, &self.q, epsilon, &mut out.q);
    }

    pub(crate) fn second_momentum_halfstep(&mut self, epsilon: f64) {
        crate::math::axpy(&self.grad, &mut self.p, epsilon / 2.);
    }

    pub(crate) fn set_psum(&self, out: &mut InnerState) {
        assert!(out.idx_in_trajectory != 0);

        if out.idx_in_trajectory == -1 {
            out.p_sum.copy_from_slice(&out.p);
        } else {
            crate::math::axpy_out(&out.p, &self.p_sum, 1., &mut out.p_sum);
        }
    }
}

#[derive(Debug)]
pub(crate) struct StateInUse {}

type Result<T> = std::result::Result<T, StateInUse>;

pub(crate) struct State {
    inner: Option<Rc<InnerState>>,
    reuser: Weak<StateStorage>,
}

impl Deref for State {
    type Target = InnerState;

    fn deref(&self) -> &Self::Target {
        self.inner.as_deref().expect("State accessed after drop")
    }
}

impl State {
    pub(crate) fn try_mut_inner(&mut self) -> Result<&mut InnerState> {
        self.inner
            .as_mut()
            .and_then(Rc::get_mut)
            .ok_or(StateInUse {})
    }

    pub(crate) fn energy(&self) -> f64 {
        self.kinetic_energy + self.potential_energy
    }

    pub(crate) fn index_in_trajectory(&self) -> i64 {
        self.idx_in_trajectory
    }

    pub(crate) fn log_acceptance_probability(&self, initial_energy: f64) -> f64 {
        (initial_energy - self.energy()).min(0.)
    }

    /// The U-turn criterion between two points of the same trajectory.
    pub(crate) fn is_turning(&self, other: &Self) -> bool {
        let (start, end) = if self.idx_in_trajectory < other.idx_in_trajectory {
            (self, other)
        } else {
            (other, self)
        };

        let a = start.idx_in_trajectory;
        let b = end.idx_in_trajectory;

        assert!(a < b);
        let (turn1, turn2) = if (a >= 0) & (b >= 0) {
            scalar_prods3(&end.p_sum, &start.p_sum, &start.p, &end.v, &start.v)
        } else if (b >= 0) & (a < 0) {
            scalar_prods2(&end.p_sum, &start.p_sum, &end.v, &start.v)
        } else {
            assert!((a < 0) & (b < 0));
            scalar_prods3(&start.p_sum, &end.p_sum, &end.p, &end.v, &start.v)
        };

        (turn1 < 0.) | (turn2 < 0.)
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if let Some(mut rc) = self.inner.take() {
            if Rc::get_mut(&mut rc).is_some() {
                if let Some(reuser) = self.reuser.upgrade() {
                    reuser.reuse_state(rc);
                }
            }
        }
    }
}

impl Clone for State {
    fn clone(&self) -> Self {
        State {
            inner: self.inner.clone(),
            reuser: self.reuser.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_pool() {
        let mut pool = StatePool::with_capacity(10, 20);
        let mut state = pool.new_state();
        assert!(state.p.len() == 10);
        state.try_mut_inner().unwrap();
    }

    #[test]
    fn shared_state_is_not_mutable() {
        let mut pool = StatePool::with_capacity(2, 4);
        let mut state = pool.new_state();
        let other = state.clone();
        assert!(state.try_mut_inner().is_err());
        drop(other);
        assert!(state.try_mut_inner().is_ok());
    }

    #[test]
    fn dropped_states_are_reused() {
        let mut pool = StatePool::with_capacity(3, 4);
        let a = pool.new_state();
        let b = a.clone();
        drop(a);
        assert_eq!(pool.free_count(), 0);
        drop(b);
        assert_eq!(pool.free_count(), 1);
        let _c = pool.new_state();
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn opposite_momenta_turn() {
        let mut pool = StatePool::with_capacity(1, 4);
        let mut start = pool.new_state();
        {
            let inner = start.try_mut_inner().unwrap();
            inner.p[0] = 1.;
            inner.v[0] = 1.;
            inner.p_sum[0] = 1.;
        }
        let mut end = pool.new_state();
        {
            let inner = end.try_mut_inner().unwrap();
            inner.idx_in_trajectory = 2;
            inner.p[0] = -3.;
            inner.v[0] = -3.;
            inner.p_sum[0] = -1.5;
        }
        assert!(start.is_turning(&end));

        {
            let inner = end.try_mut_inner().unwrap();
            inner.p[0] = 1.;
            inner.v[0] = 1.;
            inner.p_sum[0] = 3.;
        }
        assert!(!start.is_turning(&end));
    }
}
