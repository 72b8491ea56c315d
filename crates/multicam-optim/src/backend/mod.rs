//! Backend adapters that compile the IR into solver-specific problems.
//!
//! Backends translate the IR into solver-native graphs, apply manifolds and
//! fixed masks, and return a solved parameter map keyed by block name.

mod tiny_solver_backend;

use anyhow::Result;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ir::ProblemIR;

pub use tiny_solver_backend::TinySolverBackend;

/// Backend-agnostic solver options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSolveOptions {
    /// Maximum number of iterations for the optimizer.
    pub max_iters: usize,
    /// Verbosity level (backend-specific).
    pub verbosity: usize,
    /// Optional linear solver selection.
    pub linear_solver: Option<LinearSolverKind>,
    /// Absolute error decrease threshold for early termination.
    pub min_abs_decrease: Option<f64>,
    /// Relative error decrease threshold for early termination.
    pub min_rel_decrease: Option<f64>,
    /// Error threshold for early termination.
    pub min_error: Option<f64>,
}

impl Default for BackendSolveOptions {
    fn default() -> Self {
        Self {
            max_iters: 100,
            verbosity: 0,
            linear_solver: Some(LinearSolverKind::SparseCholesky),
            min_abs_decrease: Some(1e-5),
            min_rel_decrease: Some(1e-5),
            min_error: Some(1e-10),
        }
    }
}

impl BackendSolveOptions {
    /// Default options with a different iteration limit.
    pub fn with_max_iters(max_iters: usize) -> Self {
        Self {
            max_iters,
            ..Self::default()
        }
    }
}

/// Linear solver selection (backend-agnostic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinearSolverKind {
    /// Sparse Cholesky decomposition.
    SparseCholesky,
    /// Sparse QR decomposition.
    SparseQR,
}

/// Solver output from a backend.
///
/// The `params` map uses the IR parameter block names. Blocks that no residual
/// references are returned unchanged.
#[derive(Debug, Clone)]
pub struct BackendSolution {
    pub params: HashMap<String, DVector<f64>>,
    /// Final robustified cost, `0.5 * |r|^2`.
    pub final_cost: f64,
}

/// Receives progress while a solve runs.
pub trait IterationObserver {
    /// Called with the cumulative iteration count and the current cost.
    fn on_iteration(&mut self, iteration: usize, cost: f64);
}

impl<F: FnMut(usize, f64)> IterationObserver for F {
    fn on_iteration(&mut self, iteration: usize, cost: f64) {
        self(iteration, cost)
    }
}

/// Backend interface implemented by solver adapters.
pub trait OptimBackend {
    /// Solve a compiled IR with the provided initial parameters.
    fn solve(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
        opts: &BackendSolveOptions,
    ) -> Result<BackendSolution>;

    /// Solve while reporting progress every `stride` iterations.
    fn solve_observed(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
        opts: &BackendSolveOptions,
        stride: usize,
        observer: &mut dyn IterationObserver,
    ) -> Result<BackendSolution>;
}

/// Supported solver backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// tiny-solver Levenberg-Marquardt backend.
    #[default]
    TinySolver,
}

/// Solve a problem using the selected backend.
pub fn solve_with_backend(
    backend: BackendKind,
    ir: &ProblemIR,
    initial: &HashMap<String, DVector<f64>>,
    opts: &BackendSolveOptions,
) -> Result<BackendSolution> {
    match backend {
        BackendKind::TinySolver => TinySolverBackend.solve(ir, initial, opts),
    }
}

/// Like [`solve_with_backend`], but forwards progress to `observer` when one is given.
pub fn solve_with_observer(
    backend: BackendKind,
    ir: &ProblemIR,
    initial: &HashMap<String, DVector<f64>>,
    opts: &BackendSolveOptions,
    stride: usize,
    observer: Option<&mut dyn IterationObserver>,
) -> Result<BackendSolution> {
    match (backend, observer) {
        (BackendKind::TinySolver, Some(obs)) if stride > 0 => {
            TinySolverBackend.solve_observed(ir, initial, opts, stride, obs)
        }
        (BackendKind::TinySolver, _) => TinySolverBackend.solve(ir, initial, opts),
    }
}
